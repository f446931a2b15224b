//! Live, dynamically updatable workload management settings.
//!
//! The [`SettingsController`] is the single entry point for configuration
//! changes made after startup. Every update is validated against the domain
//! of its key, stored, and then delivered to all registered listeners in
//! registration order before `update` returns.
//!
//! # Keys
//!
//! | Key | Domain |
//! |-----|--------|
//! | `wlm.mode` | `DISABLED`, `MONITOR_ONLY`, `ENFORCED` |
//! | `wlm.cancellation.interval_ms` | integer > 0 |
//! | `wlm.correction.interval_ms` | integer > 0 |
//! | `wlm.stats.timeout_ms` | integer > 0 |
//! | `wlm.cancellation.monitor_only_dry_run` | `true`, `false` |
//! | `wlm.workload_group.<id>.cpu` | fraction in (0, 1] |
//! | `wlm.workload_group.<id>.memory` | fraction in (0, 1] |
//! | `wlm.workload_group.<id>.mode` | `DISABLED`, `MONITOR_ONLY`, `ENFORCED` |

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::WlmConfig;
use crate::error::{Result, WlmError};
use crate::types::{
    AdmissionControlMode, ResourceType, WorkloadGroup, WorkloadGroupId, validate_fraction,
};

const MODE: &str = "wlm.mode";
const CANCELLATION_INTERVAL: &str = "wlm.cancellation.interval_ms";
const CORRECTION_INTERVAL: &str = "wlm.correction.interval_ms";
const STATS_TIMEOUT: &str = "wlm.stats.timeout_ms";
const MONITOR_ONLY_DRY_RUN: &str = "wlm.cancellation.monitor_only_dry_run";
const GROUP_PREFIX: &str = "wlm.workload_group.";

/// A recognised settings key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SettingKey {
    /// Global admission control mode.
    Mode,
    /// Interval between cancellation sweeps.
    CancellationInterval,
    /// Interval between aggregate correction passes.
    CorrectionInterval,
    /// Per-node timeout for stats requests.
    StatsTimeout,
    /// Whether monitor-only groups are swept in dry-run mode.
    MonitorOnlyDryRun,
    /// A group's limit for one resource.
    GroupLimit {
        /// Group the limit belongs to.
        group_id: WorkloadGroupId,
        /// Limited resource.
        resource: ResourceType,
    },
    /// A group's own mode.
    GroupMode {
        /// Group the mode belongs to.
        group_id: WorkloadGroupId,
    },
}

impl SettingKey {
    /// Parses a raw key.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSetting` for unrecognised keys.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            MODE => return Ok(Self::Mode),
            CANCELLATION_INTERVAL => return Ok(Self::CancellationInterval),
            CORRECTION_INTERVAL => return Ok(Self::CorrectionInterval),
            STATS_TIMEOUT => return Ok(Self::StatsTimeout),
            MONITOR_ONLY_DRY_RUN => return Ok(Self::MonitorOnlyDryRun),
            _ => {}
        }

        let unknown = || WlmError::InvalidSetting {
            key: raw.to_string(),
            reason: "unknown setting".into(),
        };
        let rest = raw.strip_prefix(GROUP_PREFIX).ok_or_else(unknown)?;
        let (group, field) = rest.rsplit_once('.').ok_or_else(unknown)?;
        if group.trim().is_empty() {
            return Err(WlmError::InvalidSetting {
                key: raw.to_string(),
                reason: "group id cannot be empty".into(),
            });
        }
        let group_id = WorkloadGroupId::new(group);
        match field {
            "mode" => Ok(Self::GroupMode { group_id }),
            other => other
                .parse::<ResourceType>()
                .map(|resource| Self::GroupLimit { group_id, resource })
                .map_err(|_| unknown()),
        }
    }

    /// Returns the group a per-group key belongs to.
    #[must_use]
    pub const fn group_id(&self) -> Option<&WorkloadGroupId> {
        match self {
            Self::GroupLimit { group_id, .. } | Self::GroupMode { group_id } => Some(group_id),
            _ => None,
        }
    }

    /// Parses and validates a raw value for this key.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSetting` if the value is outside the key's domain.
    pub fn parse_value(&self, raw: &str) -> Result<SettingValue> {
        let invalid = |reason: String| WlmError::InvalidSetting {
            key: self.to_string(),
            reason,
        };
        let raw = raw.trim();
        match self {
            Self::Mode | Self::GroupMode { .. } => raw
                .parse::<AdmissionControlMode>()
                .map(SettingValue::Mode)
                .map_err(invalid),
            Self::CancellationInterval | Self::CorrectionInterval | Self::StatsTimeout => {
                let millis = raw
                    .parse::<u64>()
                    .map_err(|_| invalid(format!("{raw} is not a whole number of milliseconds")))?;
                if millis == 0 {
                    return Err(invalid("interval must be greater than zero".into()));
                }
                Ok(SettingValue::Duration(Duration::from_millis(millis)))
            }
            Self::MonitorOnlyDryRun => raw
                .parse::<bool>()
                .map(SettingValue::Flag)
                .map_err(|_| invalid(format!("{raw} is not true or false"))),
            Self::GroupLimit { .. } => {
                let fraction = raw
                    .parse::<f64>()
                    .map_err(|_| invalid(format!("{raw} is not a number")))?;
                validate_fraction(fraction).map_err(invalid)?;
                Ok(SettingValue::Fraction(fraction))
            }
        }
    }

    /// Checks that an already-typed value fits this key's domain.
    fn check(&self, value: &SettingValue) -> Result<()> {
        let invalid = |reason: &str| WlmError::InvalidSetting {
            key: self.to_string(),
            reason: reason.to_string(),
        };
        match (self, value) {
            (Self::Mode | Self::GroupMode { .. }, SettingValue::Mode(_))
            | (Self::MonitorOnlyDryRun, SettingValue::Flag(_)) => Ok(()),
            (
                Self::CancellationInterval | Self::CorrectionInterval | Self::StatsTimeout,
                SettingValue::Duration(d),
            ) => {
                if d.is_zero() {
                    Err(invalid("interval must be greater than zero"))
                } else {
                    Ok(())
                }
            }
            (Self::GroupLimit { .. }, SettingValue::Fraction(f)) => {
                validate_fraction(*f).map_err(|reason| invalid(&reason))
            }
            _ => Err(invalid("value has the wrong type for this key")),
        }
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mode => f.write_str(MODE),
            Self::CancellationInterval => f.write_str(CANCELLATION_INTERVAL),
            Self::CorrectionInterval => f.write_str(CORRECTION_INTERVAL),
            Self::StatsTimeout => f.write_str(STATS_TIMEOUT),
            Self::MonitorOnlyDryRun => f.write_str(MONITOR_ONLY_DRY_RUN),
            Self::GroupLimit { group_id, resource } => {
                write!(f, "{GROUP_PREFIX}{group_id}.{resource}")
            }
            Self::GroupMode { group_id } => write!(f, "{GROUP_PREFIX}{group_id}.mode"),
        }
    }
}

/// A validated setting value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SettingValue {
    /// An admission control mode.
    Mode(AdmissionControlMode),
    /// An interval or timeout.
    Duration(Duration),
    /// A limit fraction.
    Fraction(f64),
    /// A boolean switch.
    Flag(bool),
}

impl SettingValue {
    /// Returns the mode, if this is a mode value.
    #[must_use]
    pub const fn as_mode(&self) -> Option<AdmissionControlMode> {
        match self {
            Self::Mode(mode) => Some(*mode),
            _ => None,
        }
    }

    /// Returns the duration, if this is a duration value.
    #[must_use]
    pub const fn as_duration(&self) -> Option<Duration> {
        match self {
            Self::Duration(d) => Some(*d),
            _ => None,
        }
    }

    /// Returns the fraction, if this is a fraction value.
    #[must_use]
    pub const fn as_fraction(&self) -> Option<f64> {
        match self {
            Self::Fraction(f) => Some(*f),
            _ => None,
        }
    }

    /// Returns the flag, if this is a boolean value.
    #[must_use]
    pub const fn as_flag(&self) -> Option<bool> {
        match self {
            Self::Flag(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mode(mode) => write!(f, "{mode}"),
            Self::Duration(d) => write!(f, "{}", d.as_millis()),
            Self::Fraction(v) => write!(f, "{v}"),
            Self::Flag(b) => write!(f, "{b}"),
        }
    }
}

/// A change delivered to listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingChange {
    /// Key that changed.
    pub key: SettingKey,
    /// Previous value, if any.
    pub old: Option<SettingValue>,
    /// New value; `None` when the key was removed.
    pub new: Option<SettingValue>,
}

impl SettingChange {
    fn inverse(&self) -> Self {
        Self {
            key: self.key.clone(),
            old: self.new,
            new: self.old,
        }
    }
}

type Listener = Box<dyn Fn(&SettingChange) -> Result<()> + Send + Sync>;

/// Holds live settings and notifies listeners of changes.
///
/// Updates are serialized by an internal lock and listeners run while it is
/// held, so they observe changes in the order they were applied. Listeners
/// may read settings but must not call [`update`](Self::update).
///
/// A listener that returns an error vetoes the change: the stored value is
/// restored and the listeners that already accepted it receive the inverse
/// change.
pub struct SettingsController {
    values: RwLock<HashMap<SettingKey, SettingValue>>,
    listeners: RwLock<Vec<Listener>>,
    update_lock: Mutex<()>,
}

impl fmt::Debug for SettingsController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettingsController")
            .field("values", &*self.values.read())
            .field("listeners", &self.listeners.read().len())
            .finish_non_exhaustive()
    }
}

impl Default for SettingsController {
    fn default() -> Self {
        Self::new(&WlmConfig::default())
    }
}

impl SettingsController {
    /// Creates a controller seeded with the global values of `config` and
    /// the keys of its groups.
    #[must_use]
    pub fn new(config: &WlmConfig) -> Self {
        let mut values: HashMap<_, _> = config.groups.iter().flat_map(group_entries).collect();
        values.insert(SettingKey::Mode, SettingValue::Mode(config.mode));
        values.insert(
            SettingKey::CancellationInterval,
            SettingValue::Duration(config.cancellation_interval),
        );
        values.insert(
            SettingKey::CorrectionInterval,
            SettingValue::Duration(config.correction_interval),
        );
        values.insert(
            SettingKey::StatsTimeout,
            SettingValue::Duration(config.stats_timeout),
        );
        values.insert(
            SettingKey::MonitorOnlyDryRun,
            SettingValue::Flag(config.monitor_only_dry_run),
        );
        Self {
            values: RwLock::new(values),
            listeners: RwLock::new(Vec::new()),
            update_lock: Mutex::new(()),
        }
    }

    /// Returns the current value of a raw key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<SettingValue> {
        SettingKey::parse(key).ok().and_then(|k| self.get_key(&k))
    }

    /// Returns the current value of a key.
    #[must_use]
    pub fn get_key(&self, key: &SettingKey) -> Option<SettingValue> {
        self.values.read().get(key).copied()
    }

    /// Validates and applies a raw update, then notifies listeners.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSetting` for unknown keys or out-of-domain values; the
    /// stored value is left untouched.
    pub fn update(&self, key: &str, value: &str) -> Result<()> {
        let parsed = SettingKey::parse(key).and_then(|k| {
            let v = k.parse_value(value)?;
            Ok((k, v))
        });
        match parsed {
            Ok((key, value)) => self.apply(key, Some(value)),
            Err(e) => {
                warn!(key, value, error = %e, "rejected settings update");
                Err(e)
            }
        }
    }

    /// Validates and applies a typed update, then notifies listeners.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSetting` if the value does not fit the key.
    pub fn update_value(&self, key: SettingKey, value: SettingValue) -> Result<()> {
        if let Err(e) = key.check(&value) {
            warn!(key = %key, value = %value, error = %e, "rejected settings update");
            return Err(e);
        }
        self.apply(key, Some(value))
    }

    /// Removes a per-group key, notifying listeners with `new: None`.
    /// Returns the removed value.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSetting` for unknown keys and for global keys, which
    /// cannot be removed.
    pub fn remove(&self, key: &str) -> Result<Option<SettingValue>> {
        let parsed = SettingKey::parse(key)?;
        if parsed.group_id().is_none() {
            return Err(WlmError::InvalidSetting {
                key: key.to_string(),
                reason: "global settings cannot be removed".into(),
            });
        }
        let old = self.get_key(&parsed);
        if old.is_some() {
            self.apply(parsed, None)?;
        }
        Ok(old)
    }

    /// Runs `commit` under the update lock and, if it succeeds, replaces
    /// the stored keys of `group` with its limits and mode. Listeners are not
    /// notified.
    ///
    /// # Errors
    ///
    /// Returns the error of `commit`; nothing is stored in that case.
    pub fn commit_group<F>(&self, group: &WorkloadGroup, commit: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let _guard = self.update_lock.lock();
        commit()?;
        let mut values = self.values.write();
        values.retain(|key, _| key.group_id() != Some(&group.id));
        values.extend(group_entries(group));
        Ok(())
    }

    /// Runs `commit` under the update lock and, if it succeeds, drops every
    /// stored key of the group. Listeners are not notified.
    ///
    /// # Errors
    ///
    /// Returns the error of `commit`; nothing is dropped in that case.
    pub fn forget_group<F, R>(&self, group_id: &WorkloadGroupId, commit: F) -> Result<R>
    where
        F: FnOnce() -> Result<R>,
    {
        let _guard = self.update_lock.lock();
        let committed = commit()?;
        self.values
            .write()
            .retain(|key, _| key.group_id() != Some(group_id));
        Ok(committed)
    }

    /// Registers a listener. Listeners run synchronously, in registration
    /// order, after every update; an error vetoes the update.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&SettingChange) -> Result<()> + Send + Sync + 'static,
    {
        self.listeners.write().push(Box::new(listener));
    }

    /// Current global mode.
    #[must_use]
    pub fn mode(&self) -> AdmissionControlMode {
        self.get_key(&SettingKey::Mode)
            .and_then(|v| v.as_mode())
            .unwrap_or_default()
    }

    /// Current cancellation sweep interval.
    #[must_use]
    pub fn cancellation_interval(&self) -> Duration {
        self.duration(&SettingKey::CancellationInterval)
            .unwrap_or(crate::config::DEFAULT_CANCELLATION_INTERVAL)
    }

    /// Current correction pass interval.
    #[must_use]
    pub fn correction_interval(&self) -> Duration {
        self.duration(&SettingKey::CorrectionInterval)
            .unwrap_or(crate::config::DEFAULT_CORRECTION_INTERVAL)
    }

    /// Current per-node stats timeout.
    #[must_use]
    pub fn stats_timeout(&self) -> Duration {
        self.duration(&SettingKey::StatsTimeout)
            .unwrap_or(crate::config::DEFAULT_STATS_TIMEOUT)
    }

    /// Whether monitor-only groups are swept in dry-run mode.
    #[must_use]
    pub fn monitor_only_dry_run(&self) -> bool {
        self.get_key(&SettingKey::MonitorOnlyDryRun)
            .and_then(|v| v.as_flag())
            .unwrap_or(false)
    }

    fn duration(&self, key: &SettingKey) -> Option<Duration> {
        self.get_key(key).and_then(|v| v.as_duration())
    }

    fn store(&self, key: &SettingKey, value: Option<SettingValue>) -> Option<SettingValue> {
        let mut values = self.values.write();
        match value {
            Some(value) => values.insert(key.clone(), value),
            None => values.remove(key),
        }
    }

    fn apply(&self, key: SettingKey, new: Option<SettingValue>) -> Result<()> {
        let _guard = self.update_lock.lock();

        let old = self.store(&key, new);
        let change = SettingChange { key, old, new };

        let listeners = self.listeners.read();
        for (accepted, listener) in listeners.iter().enumerate() {
            if let Err(e) = listener(&change) {
                self.store(&change.key, change.old);
                let inverse = change.inverse();
                for earlier in &listeners[..accepted] {
                    if let Err(undo) = earlier(&inverse) {
                        warn!(key = %change.key, error = %undo, "listener failed to undo setting");
                    }
                }
                warn!(key = %change.key, error = %e, "setting vetoed by listener");
                return Err(e);
            }
        }
        drop(listeners);

        info!(
            key = %change.key,
            old = ?change.old.map(|v| v.to_string()),
            new = ?change.new.map(|v| v.to_string()),
            "setting applied"
        );
        Ok(())
    }
}

fn group_entries(group: &WorkloadGroup) -> Vec<(SettingKey, SettingValue)> {
    let mut entries = vec![(
        SettingKey::GroupMode {
            group_id: group.id.clone(),
        },
        SettingValue::Mode(group.mode),
    )];
    entries.extend(group.limits.iter().map(|(resource, limit)| {
        (
            SettingKey::GroupLimit {
                group_id: group.id.clone(),
                resource,
            },
            SettingValue::Fraction(limit),
        )
    }));
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use test_case::test_case;

    #[test_case("wlm.mode", SettingKey::Mode ; "mode")]
    #[test_case(
        "wlm.cancellation.interval_ms",
        SettingKey::CancellationInterval ;
        "cancellation interval"
    )]
    #[test_case("wlm.stats.timeout_ms", SettingKey::StatsTimeout ; "stats timeout")]
    #[test_case(
        "wlm.workload_group.g1.cpu",
        SettingKey::GroupLimit {
            group_id: WorkloadGroupId::new("g1"),
            resource: ResourceType::Cpu,
        } ;
        "group cpu"
    )]
    #[test_case(
        "wlm.workload_group.team.search.memory",
        SettingKey::GroupLimit {
            group_id: WorkloadGroupId::new("team.search"),
            resource: ResourceType::Memory,
        } ;
        "dotted group id"
    )]
    #[test_case(
        "wlm.workload_group.g1.mode",
        SettingKey::GroupMode { group_id: WorkloadGroupId::new("g1") } ;
        "group mode"
    )]
    fn key_round_trip(raw: &str, expected: SettingKey) {
        let key = SettingKey::parse(raw);
        assert_eq!(key.as_ref().ok(), Some(&expected));
        assert_eq!(expected.to_string(), raw);
    }

    #[test_case("wlm.unknown" ; "unknown global")]
    #[test_case("wlm.workload_group.g1.disk" ; "unknown resource")]
    #[test_case("wlm.workload_group..cpu" ; "empty group")]
    #[test_case("wlm.workload_group. .cpu" ; "blank group")]
    #[test_case("wlm.workload_group.cpu" ; "missing group")]
    fn unknown_keys(raw: &str) {
        assert!(matches!(
            SettingKey::parse(raw),
            Err(WlmError::InvalidSetting { .. })
        ));
    }

    #[test]
    fn mode_update_then_bogus_keeps_enforced() {
        let settings = SettingsController::default();
        assert!(settings.update("wlm.mode", "ENFORCED").is_ok());

        let result = settings.update("wlm.mode", "bogus");
        assert!(matches!(result, Err(WlmError::InvalidSetting { .. })));
        assert_eq!(settings.mode(), AdmissionControlMode::Enforced);
        assert_eq!(
            settings.get("wlm.mode"),
            Some(SettingValue::Mode(AdmissionControlMode::Enforced))
        );
    }

    #[test_case("wlm.workload_group.g1.cpu", "0" ; "zero limit")]
    #[test_case("wlm.workload_group.g1.cpu", "1.5" ; "limit above one")]
    #[test_case("wlm.workload_group.g1.memory", "lots" ; "non numeric limit")]
    #[test_case("wlm.cancellation.interval_ms", "0" ; "zero interval")]
    #[test_case("wlm.cancellation.interval_ms", "-5" ; "negative interval")]
    #[test_case("wlm.cancellation.monitor_only_dry_run", "yes" ; "bad flag")]
    fn invalid_values_are_rejected(key: &str, value: &str) {
        let settings = SettingsController::default();
        let before = settings.get(key);
        assert!(settings.update(key, value).is_err());
        assert_eq!(settings.get(key), before);
    }

    #[test]
    fn typed_accessors_follow_updates() {
        let settings = SettingsController::default();
        assert!(settings.update("wlm.cancellation.interval_ms", "250").is_ok());
        assert!(settings.update("wlm.correction.interval_ms", "3000").is_ok());
        assert!(settings.update("wlm.stats.timeout_ms", "100").is_ok());
        assert!(settings.update("wlm.cancellation.monitor_only_dry_run", "true").is_ok());

        assert_eq!(settings.cancellation_interval(), Duration::from_millis(250));
        assert_eq!(settings.correction_interval(), Duration::from_secs(3));
        assert_eq!(settings.stats_timeout(), Duration::from_millis(100));
        assert!(settings.monitor_only_dry_run());
    }

    #[test]
    fn listeners_run_in_registration_order() {
        let settings = SettingsController::default();
        let log = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second", "third"] {
            let log = Arc::clone(&log);
            settings.add_listener(move |change| {
                log.lock().push(format!("{name}:{}", change.key));
                Ok(())
            });
        }

        assert!(settings.update("wlm.mode", "ENFORCED").is_ok());
        assert_eq!(
            *log.lock(),
            vec!["first:wlm.mode", "second:wlm.mode", "third:wlm.mode"]
        );
    }

    #[test]
    fn listeners_see_old_and_new_values_and_can_read() {
        let settings = Arc::new(SettingsController::default());
        let seen = Arc::new(Mutex::new(None));

        let reader = Arc::clone(&settings);
        let sink = Arc::clone(&seen);
        settings.add_listener(move |change| {
            *sink.lock() = Some((change.clone(), reader.mode()));
            Ok(())
        });

        assert!(settings.update("wlm.mode", "DISABLED").is_ok());
        let (change, mode_during_callback) = seen.lock().clone().unwrap_or_else(|| {
            (
                SettingChange {
                    key: SettingKey::Mode,
                    old: None,
                    new: None,
                },
                AdmissionControlMode::Enforced,
            )
        });
        assert_eq!(change.old, Some(SettingValue::Mode(AdmissionControlMode::MonitorOnly)));
        assert_eq!(change.new, Some(SettingValue::Mode(AdmissionControlMode::Disabled)));
        assert_eq!(mode_during_callback, AdmissionControlMode::Disabled);
    }

    #[test]
    fn invalid_update_does_not_notify() {
        let settings = SettingsController::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        settings.add_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(settings.update("wlm.mode", "bogus").is_err());
        assert!(settings.update("wlm.nope", "1").is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn typed_update_is_checked() {
        let settings = SettingsController::default();
        assert!(
            settings
                .update_value(SettingKey::StatsTimeout, SettingValue::Flag(true))
                .is_err()
        );
        assert!(
            settings
                .update_value(
                    SettingKey::StatsTimeout,
                    SettingValue::Duration(Duration::from_millis(10))
                )
                .is_ok()
        );
        assert_eq!(settings.stats_timeout(), Duration::from_millis(10));
    }

    #[test]
    fn remove_group_key() {
        let settings = SettingsController::default();
        let notified = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&notified);
        settings.add_listener(move |change| {
            sink.lock().push(change.new);
            Ok(())
        });

        assert!(settings.update("wlm.workload_group.g1.cpu", "0.5").is_ok());
        let removed = settings.remove("wlm.workload_group.g1.cpu");
        assert_eq!(removed.ok().flatten(), Some(SettingValue::Fraction(0.5)));
        assert_eq!(settings.get("wlm.workload_group.g1.cpu"), None);
        assert_eq!(*notified.lock(), vec![Some(SettingValue::Fraction(0.5)), None]);

        assert!(settings.remove("wlm.mode").is_err());
    }

    #[test]
    fn forget_group_drops_only_that_group() {
        let settings = SettingsController::default();
        let _ = settings.update("wlm.workload_group.g1.cpu", "0.5");
        let _ = settings.update("wlm.workload_group.g2.cpu", "0.5");
        let forgotten = settings.forget_group(&WorkloadGroupId::new("g1"), || Ok(3));
        assert_eq!(forgotten.ok(), Some(3));
        assert_eq!(settings.get("wlm.workload_group.g1.cpu"), None);
        assert!(settings.get("wlm.workload_group.g2.cpu").is_some());
    }

    #[test]
    fn failed_forget_keeps_keys() {
        let settings = SettingsController::default();
        let _ = settings.update("wlm.workload_group.g1.cpu", "0.5");
        let result = settings.forget_group(&WorkloadGroupId::new("g1"), || {
            Err::<(), _>(WlmError::GroupNotFound {
                group_id: WorkloadGroupId::new("g1"),
            })
        });
        assert!(result.is_err());
        assert!(settings.get("wlm.workload_group.g1.cpu").is_some());
    }

    #[test]
    fn vetoed_update_is_rolled_back() {
        let settings = SettingsController::default();
        let log = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&log);
        settings.add_listener(move |change| {
            first.lock().push(change.new);
            Ok(())
        });
        settings.add_listener(|change| match change.new {
            Some(SettingValue::Fraction(f)) if f > 0.9 => Err(WlmError::InvalidSetting {
                key: change.key.to_string(),
                reason: "too generous".into(),
            }),
            _ => Ok(()),
        });
        let third = Arc::clone(&log);
        settings.add_listener(move |_| {
            third.lock().push(None);
            Ok(())
        });

        assert!(settings.update("wlm.workload_group.g1.cpu", "0.5").is_ok());
        log.lock().clear();

        let result = settings.update("wlm.workload_group.g1.cpu", "0.95");
        assert!(matches!(result, Err(WlmError::InvalidSetting { .. })));
        assert_eq!(
            settings.get("wlm.workload_group.g1.cpu"),
            Some(SettingValue::Fraction(0.5))
        );
        // The first listener saw the change and then its inverse; the third
        // never ran.
        assert_eq!(
            *log.lock(),
            vec![Some(SettingValue::Fraction(0.95)), Some(SettingValue::Fraction(0.5))]
        );
    }

    #[test]
    fn config_groups_are_seeded() {
        let config = WlmConfig::new().with_group(
            WorkloadGroup::new("g1")
                .with_cpu_limit(0.5)
                .with_mode(AdmissionControlMode::Enforced),
        );
        let settings = SettingsController::new(&config);

        assert_eq!(
            settings.get("wlm.workload_group.g1.cpu"),
            Some(SettingValue::Fraction(0.5))
        );
        assert_eq!(
            settings.get("wlm.workload_group.g1.mode"),
            Some(SettingValue::Mode(AdmissionControlMode::Enforced))
        );
        assert_eq!(settings.get("wlm.workload_group.g1.memory"), None);
        assert_eq!(
            settings.remove("wlm.workload_group.g1.cpu").ok().flatten(),
            Some(SettingValue::Fraction(0.5))
        );
    }

    #[test]
    fn commit_group_mirrors_the_group() {
        let settings = SettingsController::default();
        let _ = settings.update("wlm.workload_group.g1.memory", "0.3");

        let group = WorkloadGroup::new("g1").with_cpu_limit(0.4);
        assert!(settings.commit_group(&group, || Ok(())).is_ok());
        assert_eq!(
            settings.get("wlm.workload_group.g1.cpu"),
            Some(SettingValue::Fraction(0.4))
        );
        assert_eq!(settings.get("wlm.workload_group.g1.memory"), None);

        let failed = settings.commit_group(&WorkloadGroup::new("g1"), || {
            Err(WlmError::InvalidConfig {
                reason: "refused".into(),
            })
        });
        assert!(failed.is_err());
        assert_eq!(
            settings.get("wlm.workload_group.g1.cpu"),
            Some(SettingValue::Fraction(0.4))
        );
    }

    #[test]
    fn concurrent_readers_never_see_partial_values() {
        let settings = Arc::new(SettingsController::default());
        let writer = {
            let settings = Arc::clone(&settings);
            std::thread::spawn(move || {
                for i in 0..200 {
                    let mode = if i % 2 == 0 { "ENFORCED" } else { "DISABLED" };
                    let _ = settings.update("wlm.mode", mode);
                }
            })
        };
        for _ in 0..200 {
            let mode = settings.mode();
            assert!(matches!(
                mode,
                AdmissionControlMode::Enforced
                    | AdmissionControlMode::Disabled
                    | AdmissionControlMode::MonitorOnly
            ));
        }
        let _ = writer.join();
    }
}
