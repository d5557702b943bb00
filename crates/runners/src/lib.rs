//! 示例 Runner 与补偿器
//!
//! 代码索引 Runner（`code.index`）与文件恢复补偿器（`file.restore`）。
//! 两者通过启动装配注册，核心引擎对它们一无所知。

pub mod codeindex;
pub mod file_restore;

pub use codeindex::{CodeIndexRunner, PathFilter};
pub use file_restore::FileRestoreCompensator;
