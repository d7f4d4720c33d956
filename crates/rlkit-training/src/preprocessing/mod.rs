//! Feature normalization and batch preprocessing

pub mod batch_preprocessor;
pub mod preprocessor;

pub use batch_preprocessor::{
    ActionEncoding, BatchPreprocessor, DiscreteDqnBatchPreprocessor,
    MemoryNetworkBatchPreprocessor, PolicyNetworkBatchPreprocessor,
};
pub use preprocessor::{argmax, Postprocessor, Preprocessor, PreprocessorOptions};
