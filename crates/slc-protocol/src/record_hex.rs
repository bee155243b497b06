//! Serde adapter carrying a [`StatusRecord`] as hex-encoded wire layout.
//!
//! Use with `#[serde(with = "crate::record_hex")]`.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serializer};
use slc_core::{wire, StatusRecord};

pub fn serialize<S: Serializer>(record: &StatusRecord, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(wire::encode(record)))
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<StatusRecord, D::Error> {
    let text = String::deserialize(deserializer)?;
    let bytes = hex::decode(&text).map_err(D::Error::custom)?;
    wire::decode(&bytes).map_err(D::Error::custom)
}

