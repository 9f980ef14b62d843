//! SDK 版本与运行时元信息
//!
//! - **SDK Version** → Cargo.toml（唯一权威源）
//! - **Build Metadata** → build.rs 中由 vergen 生成

/// SDK semver，来自 Cargo.toml
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// git commit（短 sha），不在 git 仓库中构建时为 "unknown"
pub const GIT_SHA: &str = match option_env!("VERGEN_GIT_SHA") {
    Some(sha) => sha,
    None => "unknown",
};

/// build time，vergen 未生成时为 "unknown"
pub const BUILD_TIME: &str = match option_env!("VERGEN_BUILD_TIMESTAMP") {
    Some(ts) => ts,
    None => "unknown",
};

/// 形如 `onechat-sdk/0.1.0 (abc1234)` 的标识，用于日志
pub fn user_agent() -> String {
    format!("onechat-sdk/{} ({})", SDK_VERSION, GIT_SHA)
}
