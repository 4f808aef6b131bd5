pub mod augment;
pub mod balance;
pub mod builder;
pub mod manifest;
pub mod planner;
pub mod scan;
pub mod types;
pub mod writer;

pub use augment::{AugmentConfig, AugmentParams, Augmenter, IdentityAugmenter, RandomAugmenter};
pub use balance::{allocate, SplitAllocation, SplitCounts};
pub use builder::{BuildReport, ClassReport, TrainsetBuilder};
pub use manifest::DatasetManifest;
pub use planner::{group_by_class, plan_class, BoxSource, ClassPlan};
pub use scan::{count_dataset_by_class, ClassCount, CountMode, DatasetStats, FileTotals};
pub use types::{read_dimensions, BoxXyxy, DatasetLayout, LabeledSample, Split, TrainingInput};
