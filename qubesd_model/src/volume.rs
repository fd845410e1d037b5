//! Persisted volume configuration.
//!
//! The four boolean axes decide a volume's behaviour across a domain's
//! lifecycle:
//!
//! | snap_on_start | save_on_stop | rw | meaning |
//! |---|---|---|---|
//! | false | true  | true  | persistent data (`private`, template `root`) |
//! | true  | false | true  | cloned from the source at start, discarded |
//! | false | false | true  | fresh scratch space each boot (`volatile`) |
//! | any   | any   | false | read-only, provided by the pool (`kernel`) |

use qubesd_common::{QubesError, QubesResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeConfig {
    /// Slot name within the domain: `root`, `private`, `volatile`, …
    pub name: String,
    pub pool: String,
    /// Pool-unique volume id.
    pub vid: String,
    pub size: u64,
    pub rw: bool,
    pub snap_on_start: bool,
    pub save_on_stop: bool,
    /// Key the backing device with a throwaway key each start.
    pub ephemeral: bool,
    pub revisions_to_keep: usize,
    /// Vid of the volume snapshots are taken from; required when
    /// `snap_on_start` is set.
    pub source: Option<String>,
}

impl VolumeConfig {
    pub fn validate(&self) -> QubesResult<()> {
        if self.name.is_empty() || self.vid.is_empty() || self.pool.is_empty() {
            return Err(QubesError::invalid_value(
                "volume name, vid and pool must not be empty",
            ));
        }
        if self.snap_on_start && self.source.is_none() {
            return Err(QubesError::invalid_value(format!(
                "volume {} has snap_on_start but no source",
                self.name
            )));
        }
        if self.snap_on_start && self.save_on_stop {
            return Err(QubesError::invalid_value(format!(
                "volume {} cannot both snapshot on start and save on stop",
                self.name
            )));
        }
        if self.ephemeral && !self.is_volatile() {
            return Err(QubesError::invalid_value(format!(
                "volume {} is ephemeral but not volatile",
                self.name
            )));
        }
        Ok(())
    }

    /// Nothing survives a stop: no snapshot source, nothing saved.
    pub fn is_volatile(&self) -> bool {
        self.rw && !self.snap_on_start && !self.save_on_stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> VolumeConfig {
        VolumeConfig {
            name: "private".to_string(),
            pool: "default".to_string(),
            vid: "appvms/work/private".to_string(),
            size: 2 * 1024 * 1024 * 1024,
            rw: true,
            snap_on_start: false,
            save_on_stop: true,
            ephemeral: false,
            revisions_to_keep: 2,
            source: None,
        }
    }

    #[test]
    fn valid_private() {
        assert!(base().validate().is_ok());
        assert!(!base().is_volatile());
    }

    #[test]
    fn snap_requires_source() {
        let mut cfg = base();
        cfg.snap_on_start = true;
        cfg.save_on_stop = false;
        assert!(cfg.validate().is_err());
        cfg.source = Some("vm-templates/debian-12/root".to_string());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn volatile_detection() {
        let mut cfg = base();
        cfg.save_on_stop = false;
        assert!(cfg.is_volatile());
        cfg.ephemeral = true;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn ephemeral_requires_volatile() {
        let mut cfg = base();
        cfg.ephemeral = true;
        assert!(cfg.validate().is_err());
    }
}
