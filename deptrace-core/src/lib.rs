use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// 虚拟 inode 编号，0 表示“未跟踪”，由引擎按路径首次出现时分配。
pub type Inode = u64;

/// 单次 exec 的命令身份：路径、参数、工作目录，以及最终退出状态。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cmd {
    pub id: u64,
    pub exec: u64,
    pub path: PathBuf,
    pub args: Vec<String>,
    pub dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    pub exit: i32,
}

impl Cmd {
    pub fn new(path: impl Into<PathBuf>, args: Vec<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            args,
            dir: dir.into(),
            ..Self::default()
        }
    }
}

/// 一条执行记录：命令加上它读/写过的文件集合，供下游工具消费。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub cmd: Cmd,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fds: Option<BTreeMap<i32, PathBuf>>,
}
