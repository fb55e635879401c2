pub mod decoder;
pub mod queue;
pub mod record;
pub mod stats;
pub mod translator;

pub use decoder::{DecodedEvent, Decoder, RawEvent};
pub use queue::HandoffQueue;
pub use record::{MetricBatch, MetricGroup, NormalizedMetricRecord};
pub use stats::{IntervalStats, StatsRecorder, StatsReporter};
pub use translator::{TranslationRules, Translator};
