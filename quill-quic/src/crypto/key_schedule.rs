//! Per-level cipher slots.
//!
//! Initial keys exist from connection creation. Handshake and 1-RTT keys
//! appear as TLS advances. Slots are additive; the only removal is the
//! explicit discard of Initial keys once the handshake is done (or of every
//! level when the connection closes).

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace};

use super::{AeadCipher, EncryptionLevel};
use crate::error::{Error, Result};
use crate::types::{ConnectionId, Side};

#[derive(Default)]
pub struct KeySchedule {
    slots: RwLock<[Option<Arc<AeadCipher>>; 3]>,
}

impl KeySchedule {
    /// Schedule seeded with Initial keys for `dcid`.
    pub fn with_initial(dcid: &ConnectionId, side: Side) -> Result<Self> {
        let schedule = Self::default();
        schedule.set(
            EncryptionLevel::Initial,
            Arc::new(AeadCipher::initial(dcid, side)?),
        )?;
        Ok(schedule)
    }

    /// Cipher for `level`. Fails with [`Error::IllegalState`] until that
    /// level has been derived.
    pub fn get(&self, level: EncryptionLevel) -> Result<Arc<AeadCipher>> {
        self.slots.read()[level.index()]
            .clone()
            .ok_or(Error::IllegalState("cipher for level not yet derived"))
    }

    pub fn available(&self, level: EncryptionLevel) -> bool {
        self.slots.read()[level.index()].is_some()
    }

    /// Install `cipher` for `level`.
    ///
    /// Installing the same key material twice is a no-op. A cipher built for
    /// another level, or different keys for an occupied level, is rejected.
    pub fn set(&self, level: EncryptionLevel, cipher: Arc<AeadCipher>) -> Result<()> {
        if cipher.level() != level {
            return Err(Error::IllegalState("cipher level does not match slot"));
        }
        let mut slots = self.slots.write();
        match &slots[level.index()] {
            Some(existing) if existing.same_keys(&cipher) => {
                trace!(%level, "cipher already installed");
                Ok(())
            }
            Some(_) => Err(Error::IllegalState("level already has different keys")),
            None => {
                debug!(%level, "cipher installed");
                slots[level.index()] = Some(cipher);
                Ok(())
            }
        }
    }

    /// Replace Initial keys after a Retry changed the Destination
    /// Connection ID (RFC 9001 Section 5.2).
    pub fn rederive_initial(&self, dcid: &ConnectionId, side: Side) -> Result<()> {
        let cipher = Arc::new(AeadCipher::initial(dcid, side)?);
        let mut slots = self.slots.write();
        if slots[EncryptionLevel::Handshake.index()].is_some() {
            return Err(Error::IllegalState("initial keys are fixed once handshake keys exist"));
        }
        slots[EncryptionLevel::Initial.index()] = Some(cipher);
        debug!(%dcid, "initial keys re-derived");
        Ok(())
    }

    pub fn discard_initial(&self) {
        if self.slots.write()[EncryptionLevel::Initial.index()]
            .take()
            .is_some()
        {
            debug!("initial keys discarded");
        }
    }

    pub fn discard_all(&self) {
        *self.slots.write() = [None, None, None];
    }

    /// Highest level with keys, used for CONNECTION_CLOSE.
    pub fn highest_available(&self) -> Option<EncryptionLevel> {
        EncryptionLevel::ALL
            .iter()
            .rev()
            .copied()
            .find(|level| self.available(*level))
    }
}
