pub mod address_allocator; // 索引分配 + 注册表持久化
pub mod balance_reader;
pub mod erc20;
pub mod fee_estimator; // legacy / EIP-1559 双模型
pub mod transaction_inspector;
pub mod transfer_builder;

pub use address_allocator::{AccountKeys, AddressAllocationCoordinator, AllocationPass};
pub use balance_reader::BalanceReader;
pub use fee_estimator::{FeeEstimator, FeeQuote};
pub use transaction_inspector::TransactionInspector;
pub use transfer_builder::{
    OutputOutcome, OutputStatus, SplitTransferResult, TransferBuilder, TransferOutput,
    TransferResult,
};
