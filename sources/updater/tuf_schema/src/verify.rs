use crate::decoded::{Decoded, Hex};
use crate::error::{self, Result};
use crate::{Role, Root, Signed};
use snafu::{ensure, OptionExt};
use std::collections::BTreeSet;

impl Root {
    /// Checks that `role` carries valid signatures from at least `threshold` distinct keys that
    /// this root authorizes for `T::TYPE`. Signatures from unknown or unauthorized keys, invalid
    /// signatures, and repeated signatures by the same key are ignored rather than rejected.
    pub fn verify_role<T: Role>(&self, role: &Signed<T>) -> Result<()> {
        let role_keys = self
            .roles
            .get(&T::TYPE)
            .context(error::MissingRoleSnafu { role: T::TYPE })?;
        let data = role.signed.canonical_form()?;

        let mut valid: BTreeSet<&Decoded<Hex>> = BTreeSet::new();
        for signature in &role.signatures {
            if valid.contains(&signature.keyid) || !role_keys.keyids.contains(&signature.keyid) {
                continue;
            }
            if let Some(key) = self.keys.get(&signature.keyid) {
                if key.verify(&data, &signature.sig) {
                    valid.insert(&signature.keyid);
                }
            }
        }

        let valid = valid.len() as u64;
        ensure!(
            valid >= role_keys.threshold.get(),
            error::SignatureThresholdSnafu {
                role: T::TYPE,
                threshold: role_keys.threshold.get(),
                valid,
            }
        );
        Ok(())
    }

    /// Checks a root that is meant to replace this one: it must satisfy this root's root
    /// threshold and, independently, its own.
    pub fn verify_successor(&self, next: &Signed<Root>) -> Result<()> {
        self.verify_role(next)?;
        next.signed.verify_role(next)
    }
}
