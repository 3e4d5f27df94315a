//! Metrics module for Prometheus-based monitoring.
//!
//! Tracks stage outcomes and durations, structuring attempts, consolidated
//! lead records and run statuses.
//!
//! # Example
//!
//! ```ignore
//! use lead_forge::metrics::LeadMetrics;
//!
//! let metrics = LeadMetrics::new().expect("Failed to initialize metrics");
//! metrics.record_leads(3);
//! let text = metrics.export();
//! ```

pub mod prometheus;

pub use self::prometheus::LeadMetrics;
