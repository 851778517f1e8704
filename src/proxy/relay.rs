use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

use crate::common::ProxyStream;

/// 通用转发缓冲大小
pub const RELAY_BUF_SIZE: usize = 4096;
/// 首包融合读取缓冲 (TCP MSS)
pub const FIRST_PACKET_BUF_SIZE: usize = 1448;

/// 双向转发两条流，直到一侧结束。
///
/// 每个方向一个拷贝任务，经容量为 1 的通道上报终止结果，最先到达者
/// 决定返回值；随后两条流一并关闭。正常 EOF 返回 Ok。
pub async fn pipe(a: ProxyStream, b: ProxyStream) -> Result<()> {
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let (done_tx, mut done_rx) = mpsc::channel::<std::io::Result<()>>(1);
    let forward = tokio::spawn(copy_one_way(a_read, b_write, done_tx.clone()));
    let backward = tokio::spawn(copy_one_way(b_read, a_write, done_tx));

    // 只关心最先结束的方向，另一方向随流关闭而终止
    let first = done_rx.recv().await.unwrap_or(Ok(()));
    forward.abort();
    backward.abort();

    first.map_err(Into::into)
}

async fn copy_one_way(
    mut reader: ReadHalf<ProxyStream>,
    mut writer: WriteHalf<ProxyStream>,
    done: mpsc::Sender<std::io::Result<()>>,
) {
    let mut buf = vec![0u8; RELAY_BUF_SIZE];
    // an MSS-sized first read keeps the fused carrier header in one segment
    let mut read_limit = FIRST_PACKET_BUF_SIZE;
    let result = loop {
        match reader.read(&mut buf[..read_limit]).await {
            Ok(0) => break Ok(()),
            Ok(n) => {
                read_limit = RELAY_BUF_SIZE;
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    break Err(e);
                }
                // carrier wrappers buffer framed chunks internally
                if let Err(e) = writer.flush().await {
                    break Err(e);
                }
            }
            Err(e) => break Err(e),
        }
    };
    let _ = writer.shutdown().await;
    // capacity is 1; when the other direction already reported, this result
    // is intentionally dropped
    let _ = done.try_send(result);
}
