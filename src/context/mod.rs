//! 上下文组装：分层拼装、预算估算与一次性压缩

mod assembler;
mod budget;

pub use assembler::{ContextAssembler, ContextRequest, ContextStats, FACT_TAG, SUMMARY_TAG};
pub use budget::{compression_ratio, TokenEstimator};
