//! `serde(with = ...)` helper for base-unit integer fields that must cross
//! a JSON boundary as strings rather than bare numbers. Spec §6
//! "Persistence layout" mandates this for any field that can exceed 2^53:
//! a sompi balance routinely does (10^8 sompi/KAS puts 2^53 at ~90M KAS),
//! well past what JSON numbers can round-trip exactly in most parsers.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
    value.to_string().serialize(serializer)
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    String::deserialize(deserializer)?
        .parse()
        .map_err(serde::de::Error::custom)
}

/// Same contract as the module above, for the `Option<u64>` fields (a
/// per-miner payment threshold that, when set, is just as capable of
/// exceeding 2^53 as the balance it gates).
pub mod option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
        value.map(|v| v.to_string()).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => s.parse().map(Some).map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Wrapper {
        #[serde(with = "super")]
        amount: u64,
        #[serde(with = "super::option")]
        maybe_amount: Option<u64>,
    }

    #[test]
    fn round_trips_above_2_53_as_a_json_string() {
        let above_2_53 = (1u64 << 53) + 12345;
        let wrapper = Wrapper { amount: above_2_53, maybe_amount: Some(above_2_53) };

        let json = serde_json::to_value(&wrapper).unwrap();
        assert_eq!(json["amount"], serde_json::Value::String(above_2_53.to_string()));
        assert_eq!(json["maybe_amount"], serde_json::Value::String(above_2_53.to_string()));

        let round_tripped: Wrapper = serde_json::from_value(json).unwrap();
        assert_eq!(round_tripped.amount, above_2_53);
        assert_eq!(round_tripped.maybe_amount, Some(above_2_53));
    }

    #[test]
    fn none_serializes_to_null() {
        let wrapper = Wrapper { amount: 0, maybe_amount: None };
        let json = serde_json::to_value(&wrapper).unwrap();
        assert_eq!(json["maybe_amount"], serde_json::Value::Null);
    }
}
