//! Product families and their time steps.

use crate::error::{RegistryError, RegistryResult};
use cache_store::CacheStore;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use pyramid::PyramidConfig;
use raster_ops::AggregationMethod;
use serde::Serialize;
use sift_common::{CacheKey, SourceDescriptor};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// One registered time step of a product family.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeEntry {
    /// Dataset id, new for every registration of this time step.
    pub id: Uuid,
    pub time: DateTime<Utc>,
    pub descriptor: SourceDescriptor,
    pub registered_at: DateTime<Utc>,
}

impl TimeEntry {
    /// Cache key of the raw (level 0) array.
    pub fn key(&self) -> CacheKey {
        self.descriptor.source_key()
    }
}

/// A time step resolved to everything the pyramid builder needs.
#[derive(Debug, Clone)]
pub struct ResolvedSource {
    pub family: String,
    pub entry: TimeEntry,
    pub aggregation: AggregationMethod,
}

/// Outcome of a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// A new time step was appended.
    Added(Uuid),
    /// The descriptor of an existing, idle time step was replaced.
    Replaced(Uuid),
    /// The same descriptor was already registered.
    Unchanged(Uuid),
}

impl Registration {
    pub fn id(&self) -> Uuid {
        match self {
            Registration::Added(id) | Registration::Replaced(id) | Registration::Unchanged(id) => {
                *id
            }
        }
    }
}

struct Slot {
    entry: TimeEntry,
    checkouts: usize,
}

#[derive(Default)]
struct Family {
    times: BTreeMap<DateTime<Utc>, Slot>,
}

struct Inner {
    families: RwLock<HashMap<String, Family>>,
    store: Arc<CacheStore>,
    pyramid: PyramidConfig,
}

/// Maps `(family, time)` to source descriptors and their cache keys.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct LayerRegistry {
    inner: Arc<Inner>,
}

impl LayerRegistry {
    /// `pyramid` must match the builder's configuration so resolved
    /// aggregations agree with the keys the builder writes.
    pub fn new(store: Arc<CacheStore>, pyramid: PyramidConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                families: RwLock::new(HashMap::new()),
                store,
                pyramid,
            }),
        }
    }

    /// Register `descriptor` as `family` at `time`.
    ///
    /// New times are appended. An existing time may only change its
    /// descriptor while nothing is cached for it and no job has it checked
    /// out; a key already handed to a job never changes underneath it.
    pub fn register(
        &self,
        family: &str,
        time: DateTime<Utc>,
        descriptor: SourceDescriptor,
    ) -> RegistryResult<Registration> {
        let mut families = self.inner.families.write();
        let fam = families.entry(family.to_string()).or_default();

        let outcome = match fam.times.get_mut(&time) {
            Some(slot) if slot.entry.descriptor == descriptor => {
                Registration::Unchanged(slot.entry.id)
            }
            Some(slot) => {
                if slot.checkouts > 0 {
                    return Err(RegistryError::InUse {
                        family: family.to_string(),
                        time,
                        jobs: slot.checkouts,
                    });
                }
                if self.inner.store.contains(&slot.entry.key()) {
                    return Err(RegistryError::Cached {
                        family: family.to_string(),
                        time,
                    });
                }
                let id = Uuid::new_v4();
                slot.entry = TimeEntry {
                    id,
                    time,
                    descriptor,
                    registered_at: Utc::now(),
                };
                Registration::Replaced(id)
            }
            None => {
                let id = Uuid::new_v4();
                fam.times.insert(
                    time,
                    Slot {
                        entry: TimeEntry {
                            id,
                            time,
                            descriptor,
                            registered_at: Utc::now(),
                        },
                        checkouts: 0,
                    },
                );
                Registration::Added(id)
            }
        };

        match outcome {
            Registration::Unchanged(_) => {
                debug!(family, time = %time, "Time step already registered");
            }
            _ => {
                metrics::counter!("sift_registry_registrations_total").increment(1);
                info!(family, time = %time, id = %outcome.id(), "Registered time step");
            }
        }
        Ok(outcome)
    }

    /// Level-0 cache key of `family` at exactly `time`.
    pub fn resolve(&self, family: &str, time: DateTime<Utc>) -> RegistryResult<CacheKey> {
        self.entry(family, time).map(|e| e.key())
    }

    pub fn entry(&self, family: &str, time: DateTime<Utc>) -> RegistryResult<TimeEntry> {
        let families = self.inner.families.read();
        let fam = families
            .get(family)
            .ok_or_else(|| RegistryError::UnknownFamily(family.to_string()))?;
        fam.times
            .get(&time)
            .map(|slot| slot.entry.clone())
            .ok_or_else(|| RegistryError::UnknownTime {
                family: family.to_string(),
                time,
            })
    }

    /// Descriptor and aggregation for building `family` at `time`.
    pub fn resolve_source(
        &self,
        family: &str,
        time: DateTime<Utc>,
    ) -> RegistryResult<ResolvedSource> {
        let entry = self.entry(family, time)?;
        let aggregation = self
            .inner
            .pyramid
            .aggregation_for(entry.descriptor.display_name());
        Ok(ResolvedSource {
            family: family.to_string(),
            entry,
            aggregation,
        })
    }

    /// Registered time closest to `requested`; ties go to the earlier time.
    pub fn nearest_time(
        &self,
        family: &str,
        requested: DateTime<Utc>,
    ) -> RegistryResult<DateTime<Utc>> {
        let families = self.inner.families.read();
        let fam = families
            .get(family)
            .ok_or_else(|| RegistryError::UnknownFamily(family.to_string()))?;

        let before = fam.times.range(..=requested).next_back().map(|(t, _)| *t);
        let after = fam.times.range(requested..).next().map(|(t, _)| *t);

        match (before, after) {
            (Some(b), Some(a)) => {
                if (a - requested) < (requested - b) {
                    Ok(a)
                } else {
                    Ok(b)
                }
            }
            (Some(t), None) | (None, Some(t)) => Ok(t),
            (None, None) => Err(RegistryError::UnknownTime {
                family: family.to_string(),
                time: requested,
            }),
        }
    }

    /// Registered times of `family`, ascending.
    pub fn times(&self, family: &str) -> RegistryResult<Vec<DateTime<Utc>>> {
        let families = self.inner.families.read();
        families
            .get(family)
            .map(|fam| fam.times.keys().copied().collect())
            .ok_or_else(|| RegistryError::UnknownFamily(family.to_string()))
    }

    /// Family names, sorted.
    pub fn families(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.families.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether the level-0 array of `family` at `time` is in the store.
    pub fn is_cached(&self, family: &str, time: DateTime<Utc>) -> bool {
        self.resolve(family, time)
            .map(|key| self.inner.store.contains(&key))
            .unwrap_or(false)
    }

    /// Mark `family` at `time` in use until the guard drops. While any
    /// checkout is live the time step's descriptor cannot be replaced.
    pub fn checkout(&self, family: &str, time: DateTime<Utc>) -> RegistryResult<Checkout> {
        let mut families = self.inner.families.write();
        let slot = families
            .get_mut(family)
            .ok_or_else(|| RegistryError::UnknownFamily(family.to_string()))?
            .times
            .get_mut(&time)
            .ok_or_else(|| RegistryError::UnknownTime {
                family: family.to_string(),
                time,
            })?;
        slot.checkouts += 1;

        Ok(Checkout {
            inner: self.inner.clone(),
            family: family.to_string(),
            entry: slot.entry.clone(),
        })
    }

    /// Live checkouts of `family` at `time`.
    pub fn checkouts(&self, family: &str, time: DateTime<Utc>) -> usize {
        self.inner
            .families
            .read()
            .get(family)
            .and_then(|fam| fam.times.get(&time))
            .map(|slot| slot.checkouts)
            .unwrap_or(0)
    }
}

/// A time step held by a job. Releases the hold on drop.
#[must_use = "the time step is released as soon as the checkout is dropped"]
pub struct Checkout {
    inner: Arc<Inner>,
    family: String,
    entry: TimeEntry,
}

impl Checkout {
    pub fn family(&self) -> &str {
        &self.family
    }

    /// The entry as it was when checked out; it cannot change while held.
    pub fn entry(&self) -> &TimeEntry {
        &self.entry
    }
}

impl std::fmt::Debug for Checkout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checkout")
            .field("family", &self.family)
            .field("time", &self.entry.time)
            .finish()
    }
}

impl Drop for Checkout {
    fn drop(&mut self) {
        let mut families = self.inner.families.write();
        if let Some(slot) = families
            .get_mut(&self.family)
            .and_then(|fam| fam.times.get_mut(&self.entry.time))
        {
            slot.checkouts = slot.checkouts.saturating_sub(1);
        }
    }
}
