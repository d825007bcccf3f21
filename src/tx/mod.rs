//! Transaction module: fee policy, assembly, idempotent sending and the pipeline tying them together

mod builder;
mod gas;
mod pipeline;
mod sender;

pub use builder::{fees_of, with_fees, CallParams, TxBuilder};
pub use gas::{gwei_to_wei, GasPolicy, GasQuote, QuoteSource};
pub use pipeline::{Submission, TransactionPipeline};
pub use sender::{Replacement, SendOutcome, TransactionSender};
