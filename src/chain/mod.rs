//! Chain Data Layer
//!
//! Two ways to answer "which block was current at time T" and "how much of
//! the stablecoin moved through this pool between blocks A and B":
//! - `indexer`: Etherscan-compatible explorer API (primary)
//! - `rpc`: raw JSON-RPC, used when the indexer plan doesn't cover the chain

pub mod indexer;
pub mod rpc;
mod types;

pub use indexer::{IndexerClient, IndexerEndpoint, IndexerMode};
pub use rpc::{BlockHeader, RpcClient};
pub use types::*;
