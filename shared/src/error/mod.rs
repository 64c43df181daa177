//! Errors shared by the dispatch server, driver devices and consoles
//!
//! Every failure that crosses a process boundary is an [`AppError`]: a
//! numeric [`ErrorCode`], a message and optional details. The code's range
//! gives its [`ErrorCategory`]:
//!
//! | Range | Category | Examples |
//! |-------|----------|----------|
//! | 0xxx | General | validation, not found |
//! | 1xxx | Planning | configuration, infeasible assignment |
//! | 2xxx | Dispatch | illegal transition, capacity, unknown stop |
//! | 3xxx | Sync | conflict, protocol mismatch, not subscribed |
//! | 4xxx | Provider | distance service unavailable |
//! | 5xxx | Offline | replay exhausted, queue item not found |
//! | 9xxx | System | storage, internal; the only retryable range |
//!
//! ```
//! use shared::error::{AppError, ErrorCode};
//!
//! let err = AppError::sync_conflict("stop already completed").with_detail("order_id", "o-5");
//! assert_eq!(err.code, ErrorCode::SyncConflict);
//! assert!(!err.is_retryable());
//! ```

mod category;
mod codes;
mod http;
mod types;

pub use category::ErrorCategory;
pub use codes::{ErrorCode, InvalidErrorCode};
pub use types::{ApiResponse, AppError, AppResult};
