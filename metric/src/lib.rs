//! In-process metric instruments.
//!
//! A deliberately small surface: named metrics are registered once against a
//! shared [`Registry`], and each metric fans out into per-attribute-set
//! observers (e.g. one counter per flush trigger). An external exporter can
//! walk the registry; none is wired in-core.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use parking_lot::Mutex;
use std::{
    any::Any,
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// An ordered set of key-value attributes identifying one observer of a
/// metric, e.g. `{"trigger" => "rows"}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Attributes(BTreeMap<&'static str, String>);

impl Attributes {
    /// Iterate over the attribute pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> + '_ {
        self.0.iter().map(|(k, v)| (*k, v.as_str()))
    }
}

impl<const N: usize> From<&[(&'static str, &str); N]> for Attributes {
    fn from(pairs: &[(&'static str, &str); N]) -> Self {
        Self(
            pairs
                .iter()
                .map(|(k, v)| (*k, v.to_string()))
                .collect(),
        )
    }
}

impl From<&[(&'static str, &str)]> for Attributes {
    fn from(pairs: &[(&'static str, &str)]) -> Self {
        Self(
            pairs
                .iter()
                .map(|(k, v)| (*k, v.to_string()))
                .collect(),
        )
    }
}

/// A monotonically increasing counter.
#[derive(Debug, Clone, Default)]
pub struct U64Counter {
    value: Arc<AtomicU64>,
}

impl U64Counter {
    /// Add `count` to the counter.
    pub fn inc(&self, count: u64) {
        self.value.fetch_add(count, Ordering::Relaxed);
    }

    /// Read the current value.
    pub fn fetch(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A gauge holding the latest observed value.
#[derive(Debug, Clone, Default)]
pub struct U64Gauge {
    value: Arc<AtomicU64>,
}

impl U64Gauge {
    /// Overwrite the gauge with `value`.
    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Read the current value.
    pub fn fetch(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A named metric that fans out into one observer per attribute set.
///
/// Cloning is cheap and clones share the underlying observers.
#[derive(Debug, Clone)]
pub struct Metric<T> {
    name: &'static str,
    description: &'static str,
    observers: Arc<Mutex<BTreeMap<Attributes, T>>>,
}

impl<T: Clone + Default> Metric<T> {
    fn new(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            observers: Default::default(),
        }
    }

    /// The registered name of this metric.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The registered help text of this metric.
    pub fn description(&self) -> &'static str {
        self.description
    }

    /// Get or create the observer for `attributes`.
    pub fn recorder(&self, attributes: impl Into<Attributes>) -> T {
        self.observers
            .lock()
            .entry(attributes.into())
            .or_default()
            .clone()
    }

    /// Look up the observer for `attributes`, if it has been created.
    pub fn get_observer(&self, attributes: &Attributes) -> Option<T> {
        self.observers.lock().get(attributes).cloned()
    }
}

/// A registry of metrics, shared across the process.
#[derive(Debug, Default)]
pub struct Registry {
    instruments: Mutex<BTreeMap<&'static str, Box<dyn Any + Send + Sync>>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Default::default()
    }

    /// Register (or fetch the previously registered) metric called `name`.
    ///
    /// # Panics
    ///
    /// If `name` was previously registered with a different instrument type.
    pub fn register_metric<T: Clone + Default + Send + Sync + 'static>(
        &self,
        name: &'static str,
        description: &'static str,
    ) -> Metric<T> {
        let mut instruments = self.instruments.lock();
        let entry = instruments
            .entry(name)
            .or_insert_with(|| Box::new(Metric::<T>::new(name, description)));

        entry
            .downcast_ref::<Metric<T>>()
            .unwrap_or_else(|| panic!("metric {name} registered with a different type"))
            .clone()
    }

    /// Look up a previously registered metric by name.
    pub fn get_instrument<T: Clone + Default + Send + Sync + 'static>(
        &self,
        name: &'static str,
    ) -> Option<Metric<T>> {
        self.instruments
            .lock()
            .get(name)
            .and_then(|m| m.downcast_ref::<Metric<T>>())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_observers_are_shared_per_attributes() {
        let registry = Registry::new();
        let metric: Metric<U64Counter> =
            registry.register_metric("ingest_jobs", "jobs processed by outcome");

        let ok = metric.recorder(&[("outcome", "success")]);
        let failed = metric.recorder(&[("outcome", "failure")]);
        ok.inc(2);
        failed.inc(1);
        // a second recorder for the same attributes observes the same value
        metric.recorder(&[("outcome", "success")]).inc(1);

        let fetched: Metric<U64Counter> = registry.get_instrument("ingest_jobs").unwrap();
        assert_eq!(
            fetched
                .get_observer(&Attributes::from(&[("outcome", "success")]))
                .unwrap()
                .fetch(),
            3
        );
        assert_eq!(
            fetched
                .get_observer(&Attributes::from(&[("outcome", "failure")]))
                .unwrap()
                .fetch(),
            1
        );
    }

    #[test]
    fn gauge_holds_latest_value() {
        let registry = Registry::new();
        let metric: Metric<U64Gauge> = registry.register_metric("spool_bytes", "spool size");
        let gauge = metric.recorder(&[("dataset", "obs-1")]);

        gauge.set(100);
        gauge.set(40);
        assert_eq!(gauge.fetch(), 40);
    }

    #[test]
    fn unknown_instrument_is_none() {
        let registry = Registry::new();
        assert!(registry.get_instrument::<U64Counter>("nope").is_none());
    }

    #[test]
    #[should_panic(expected = "registered with a different type")]
    fn type_mismatch_panics() {
        let registry = Registry::new();
        let _: Metric<U64Counter> = registry.register_metric("m", "");
        let _: Metric<U64Gauge> = registry.register_metric("m", "");
    }
}
