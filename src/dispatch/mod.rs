//! Query dispatch to content nodes
//!
//! Everything between a routing decision and a per-node outcome: the
//! connection pool, payload compression, the RPC transport and the
//! single-use invokers that run one exchange each.

pub mod compression;
pub mod factory;
pub mod interleaved;
pub mod invoker;
pub mod pool;
pub mod protocol;
pub mod tcp;
pub mod transport;

pub use compression::{Compressed, CompressionType, Compressor};
pub use factory::{DispatchPlan, InvokerFactory, RpcPinger, SearchInvokers};
pub use interleaved::{collect_group, CoverageSummary, GroupOutcome};
pub use invoker::{FillInvoker, InvokerState, NodeOutcome, Outcome, SearchInvoker};
pub use pool::RpcResourcePool;
pub use protocol::{DocumentSummary, GlobalId, Hit, SearchResult, SummaryEncoding};
pub use tcp::{serve, RpcHandler, TcpConnection, TcpRpcClient};
pub use transport::{NodeConnection, RpcClient, RpcRequest, RpcResponse};
