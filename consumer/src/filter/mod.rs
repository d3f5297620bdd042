pub mod correlation;
pub mod matcher;
pub mod orb;
pub mod reference;
pub mod traits;

pub use correlation::CorrelationDetector;
pub use orb::{OrbConfig, OrbExtractor};
pub use reference::{DescriptorMatcher, ReferenceError, TrainedReferenceSet};
pub use traits::{DuplicateDetector, ReferenceMatcher};
