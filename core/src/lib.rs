pub mod tensor;
pub mod error;
pub mod options;
pub mod den_graph;
pub mod supervision;
pub mod numerator;
pub mod denominator;
pub mod regression;
pub mod training;
pub mod compute_prob;
#[cfg(feature = "internal")]
pub mod gradient;
#[cfg(not(feature = "internal"))]
pub(crate) mod gradient;
