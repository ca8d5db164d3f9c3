pub mod config;
pub mod digest;
pub mod disk;
pub mod drift;
pub mod error;
pub mod export;
pub mod extract;
pub mod filter;
pub mod layout;
pub mod materialize;
pub mod notifier;
pub mod overlay;
pub mod report;
pub mod sources;
pub mod task;

// Re-exports for easy access
pub use config::Config;
pub use disk::{DiskImage, Mounter, SystemMounter};
pub use drift::{detect_drift, DriftReport};
pub use error::{Failure, ForensicsError};
pub use export::{ExportJob, ExportKinds, Targets};
pub use filter::LabelFilter;
pub use layout::{RuntimeKind, StorageRoot};
pub use notifier::Notifier;
pub use overlay::{LayerStack, MergedView};
pub use sources::{ContainerExplorer, ContainerRecord, MetadataExtractor};
pub use task::{CancelToken, Task, TaskResult};
