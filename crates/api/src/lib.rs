//! 管理界面（HTTP）
//!
//! 运营操作入口：建调度、入队、启停、删除、取消与手动执行。
//! 所有 POST 统一重定向回 `/`，结果通过 ok / type / payload / cost /
//! error / info 查询字段回显。

pub mod handlers;
pub mod routes;
pub mod time;

pub use routes::{create_routes, AppState};
