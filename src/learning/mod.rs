//! Learning loop
//!
//! Pattern store maintenance and the feedback that drives it.

pub mod feedback;
pub mod learner;
pub mod pattern;

pub use feedback::FeedbackLoop;
pub use learner::{FeedbackSample, LearnOutcome, LearnRequest, PatternLearner, PatternMatch};
