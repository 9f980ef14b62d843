//! 输入框状态

/// 消息输入框
///
/// 输入非空时发送按钮可用；只有消息成功写入后才清空。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Composer {
    input: String,
}

impl Composer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_input(&mut self, input: impl Into<String>) {
        self.input = input.into();
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    /// 发送按钮是否可用
    pub fn can_submit(&self) -> bool {
        !self.input.is_empty()
    }

    pub fn clear(&mut self) {
        self.input.clear();
    }
}
