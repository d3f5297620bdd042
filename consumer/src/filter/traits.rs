use slide_sieve_common::frame::Frame;

/// Cheap symmetric similarity used for near-duplicate suppression.
///
/// The window stores one `Signature` per accepted frame, so the expensive
/// part of a comparison (downscaling, colour conversion) runs once per frame.
pub trait DuplicateDetector: Send {
    type Signature: Clone + Send;

    fn signature(&self, frame: &Frame) -> Self::Signature;

    /// Similarity score; higher means more alike.
    fn similarity(&self, a: &Self::Signature, b: &Self::Signature) -> f64;

    /// Pairs scoring at or above this value are duplicates.
    fn threshold(&self) -> f64;

    fn is_duplicate(&self, a: &Self::Signature, b: &Self::Signature) -> bool {
        self.similarity(a, b) >= self.threshold()
    }

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

/// Existential check of a frame against a fixed collection of known imagery.
pub trait ReferenceMatcher: Send {
    /// Returns `true` if the frame matches any reference.
    fn matches(&self, frame: &Frame) -> bool;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}
