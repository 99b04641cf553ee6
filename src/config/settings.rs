use std::time::Duration;

use serde::Deserialize;

use crate::pipeline::{FailurePolicy, Route, StreamKind, WorkerConfig};

/// Top-level configuration settings for the application.
///
/// Built once at startup and passed explicitly to the broker, the emitter
/// and the listeners; nothing reads it globally.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub producer: ProducerSettings,
    pub worker: WorkerSettings,
    pub streams: Vec<StreamSettings>,
}

/// Where the broker listens (and where clients connect), plus its storage.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub data_dir: String,
    pub connect_timeout_ms: u64,
}

impl BrokerSettings {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ProducerSettings {
    pub input_file: String,
    pub record_delay_ms: u64,
    pub has_headers: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct WorkerSettings {
    pub prefetch: u16,
    pub failure_policy: FailurePolicy,
    pub work_ms_per_dot: u64,
}

/// One routed column: its values go to `queue` and end up in `output`.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct StreamSettings {
    pub kind: StreamKind,
    pub queue: String,
    pub column: usize,
    pub output: String,
}

impl StreamSettings {
    pub fn route(&self) -> Route {
        Route::new(&self.queue, self.column)
    }

    pub fn worker_config(&self, worker: &WorkerSettings) -> WorkerConfig {
        WorkerConfig {
            queue: self.queue.clone(),
            consumer_tag: format!("{}-worker", self.kind),
            prefetch: worker.prefetch,
            failure_policy: worker.failure_policy,
            work_per_dot: Duration::from_millis(worker.work_ms_per_dot),
        }
    }
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub broker: Option<PartialBrokerSettings>,
    pub producer: Option<PartialProducerSettings>,
    pub worker: Option<PartialWorkerSettings>,
    /// Replaces the default streams as a whole when present.
    pub streams: Option<Vec<StreamSettings>>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub data_dir: Option<String>,
    pub connect_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialProducerSettings {
    pub input_file: Option<String>,
    pub record_delay_ms: Option<u64>,
    pub has_headers: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialWorkerSettings {
    pub prefetch: Option<u16>,
    pub failure_policy: Option<FailurePolicy>,
    pub work_ms_per_dot: Option<u64>,
}

impl Settings {
    /// Fills every value `partial` leaves out from `self`.
    pub fn merge(self, partial: PartialSettings) -> Self {
        let broker = partial.broker.unwrap_or_default();
        let producer = partial.producer.unwrap_or_default();
        let worker = partial.worker.unwrap_or_default();

        Self {
            broker: BrokerSettings {
                host: broker.host.unwrap_or(self.broker.host),
                port: broker.port.unwrap_or(self.broker.port),
                data_dir: broker.data_dir.unwrap_or(self.broker.data_dir),
                connect_timeout_ms: broker
                    .connect_timeout_ms
                    .unwrap_or(self.broker.connect_timeout_ms),
            },
            producer: ProducerSettings {
                input_file: producer.input_file.unwrap_or(self.producer.input_file),
                record_delay_ms: producer
                    .record_delay_ms
                    .unwrap_or(self.producer.record_delay_ms),
                has_headers: producer.has_headers.unwrap_or(self.producer.has_headers),
            },
            worker: WorkerSettings {
                prefetch: worker.prefetch.unwrap_or(self.worker.prefetch),
                failure_policy: worker.failure_policy.unwrap_or(self.worker.failure_policy),
                work_ms_per_dot: worker.work_ms_per_dot.unwrap_or(self.worker.work_ms_per_dot),
            },
            streams: partial.streams.unwrap_or(self.streams),
        }
    }
}

/// Provides default values for `Settings`.
///
/// The two default streams read the smoker (column 8) and region (column 9)
/// fields of the insurance data set.
impl Default for Settings {
    fn default() -> Self {
        Self {
            broker: BrokerSettings {
                host: "127.0.0.1".to_string(),
                port: 5680,
                data_dir: "taskfan_data".to_string(),
                connect_timeout_ms: 5000,
            },
            producer: ProducerSettings {
                input_file: "data.csv".to_string(),
                record_delay_ms: 2000,
                has_headers: false,
            },
            worker: WorkerSettings {
                prefetch: 1,
                failure_policy: FailurePolicy::Ack,
                work_ms_per_dot: 1000,
            },
            streams: vec![
                StreamSettings {
                    kind: StreamKind::Smoker,
                    queue: "task_queue_smoker".to_string(),
                    column: 8,
                    output: "data_smoker_output.csv".to_string(),
                },
                StreamSettings {
                    kind: StreamKind::Region,
                    queue: "task_queue_region".to_string(),
                    column: 9,
                    output: "data_region_output.csv".to_string(),
                },
            ],
        }
    }
}
