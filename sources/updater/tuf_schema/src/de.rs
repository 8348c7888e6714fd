use crate::decoded::{Decoded, Hex};
use crate::error;
use crate::key::Key;
use crate::{Signature, Signed};
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;
use snafu::ensure;
use std::collections::BTreeMap;
use std::fmt;

/// Validates the key ID for each key during deserialization and fails if any don't match.
pub(super) fn deserialize_keys<'de, D>(
    deserializer: D,
) -> Result<BTreeMap<Decoded<Hex>, Key>, D::Error>
where
    D: Deserializer<'de>,
{
    // Fails if a key ID doesn't match its contents or if a key ID is repeated.
    fn validate_and_insert_entry(
        keyid: Decoded<Hex>,
        key: Key,
        map: &mut BTreeMap<Decoded<Hex>, Key>,
    ) -> Result<(), error::Error> {
        let calculated = key.key_id()?;
        ensure!(
            keyid == calculated,
            error::InvalidKeyIdSnafu {
                keyid: keyid.as_encoded(),
                calculated: calculated.as_encoded(),
            }
        );
        let keyid_hex = keyid.as_encoded().to_owned();
        ensure!(
            map.insert(keyid, key).is_none(),
            error::DuplicateKeyIdSnafu { keyid: keyid_hex }
        );
        Ok(())
    }

    struct Visitor;

    impl<'de> serde::de::Visitor<'de> for Visitor {
        type Value = BTreeMap<Decoded<Hex>, Key>;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a map of key IDs to keys")
        }

        fn visit_map<M>(self, mut access: M) -> Result<Self::Value, M::Error>
        where
            M: serde::de::MapAccess<'de>,
        {
            let mut map = BTreeMap::new();
            while let Some((keyid, key)) = access.next_entry()? {
                validate_and_insert_entry(keyid, key, &mut map).map_err(M::Error::custom)?;
            }
            Ok(map)
        }
    }

    deserializer.deserialize_map(Visitor)
}

impl<'de, T> Deserialize<'de> for Signed<T>
where
    T: Serialize + DeserializeOwned,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Raw {
            signed: Box<RawValue>,
            signatures: Vec<Signature>,
        }

        let raw = Raw::deserialize(deserializer)?;
        let signed: T = serde_json::from_str(raw.signed.get()).map_err(D::Error::custom)?;
        let received: Value = serde_json::from_str(raw.signed.get()).map_err(D::Error::custom)?;
        let modeled = serde_json::to_value(&signed).map_err(D::Error::custom)?;
        if modeled != received {
            return Err(D::Error::custom(
                "signed payload has fields that its signatures would not cover",
            ));
        }
        Ok(Signed {
            signed,
            signatures: raw.signatures,
        })
    }
}
