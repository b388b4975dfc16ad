pub mod abi;
pub mod provider;
pub mod rpc;
pub mod ws;

pub use provider::{
    InclusionOutcome, LogEvent, LogFilter, Query, ReadProvider, SubscriptionTransport, TxHandle,
    WriteCall, WriteProvider,
};
