use std::{io, sync::Arc};

use bytes::Bytes;

/// 字节流上的不透明变换层，例如传输加密。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 连接引擎只负责搬运字节；加密等需要整体包裹字节流的能力以“入站解码 / 出站编码”两个钩子接入，
///   不侵入 Dispatcher 与队列逻辑。
///
/// ## 契约（What）
/// - `inbound`：Dispatcher 线程上、字节进入读队列之前调用，输入为一次套接字读取得到的原始字节；
/// - `outbound`：字节进入写队列之前调用（写标记存续期间在标记提交时调用）；
/// - 两个钩子都可能返回空 `Bytes`（例如变换层需要更多输入才能产出数据）；
/// - 返回错误视为传输故障：连接被关闭并投递断开回调；
/// - 实现需自行处理内部可变状态的同步，引擎保证同一方向上的调用按字节顺序串行发生。
pub trait StreamTransform: Send + Sync + 'static {
    fn inbound(&self, data: Bytes) -> io::Result<Bytes>;

    fn outbound(&self, data: Bytes) -> io::Result<Bytes>;
}

/// 为每条接入连接构造独立变换实例的工厂。
pub type TransformFactory = Arc<dyn Fn() -> Arc<dyn StreamTransform> + Send + Sync>;
