pub mod cs;
pub mod epoch;
pub mod fib;
pub mod ndt;
pub mod pcct;
pub mod timer;

pub use epoch::{EpochHandle, Quiescence};
pub use fib::{Fib, FibConfig, FibRealEntry, StrategyKind};
pub use ndt::{Ndt, NdtConfig, NdtQuerier};
pub use pcct::{PcctConfig, PcctShard, SuppressConfig};
