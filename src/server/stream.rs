//! MJPEG 推流
//!
//! 每个观看者一个独立的流: 等待 FrameStore 更新通知, 取槽位最新结果,
//! 同一结果只发送一次. JPEG 编码结果缓存在 `AnnotatedFrame` 上, 多个观看者共享

use std::convert::Infallible;
use std::sync::Arc;

use async_stream::stream;
use bytes::{BufMut, Bytes, BytesMut};
use futures_core::Stream;

use crate::detection::AnnotatedFrame;
use crate::pipeline::{FrameStore, Slot};
use crate::shutdown::Shutdown;

pub const BOUNDARY: &str = "frame";
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

#[derive(Clone)]
pub struct StreamMultiplexer {
    store: Arc<FrameStore>,
    quality: u8,
    shutdown: Shutdown,
}

impl StreamMultiplexer {
    pub fn new(store: Arc<FrameStore>, quality: u8, shutdown: Shutdown) -> Self {
        Self {
            store,
            quality,
            shutdown,
        }
    }

    /// 打开一个新的推流; 槽位为空时等待, 编码失败的帧跳过, 退出信号时结束
    pub fn open_stream(&self, slot: Slot) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
        let store = self.store.clone();
        let shutdown = self.shutdown.clone();
        let quality = self.quality;
        // 先订阅再读取, 不会漏掉两者之间的写入
        let mut updates = store.subscribe();

        stream! {
            let mut last: Option<Arc<AnnotatedFrame>> = None;
            loop {
                if let Some(frame) = store.read_slot(slot) {
                    let fresh = last.as_ref().map_or(true, |prev| !Arc::ptr_eq(prev, &frame));
                    if fresh {
                        last = Some(frame.clone());
                        match tokio::task::spawn_blocking(move || frame.jpeg(quality)).await {
                            Ok(Ok(jpeg)) => {
                                yield Ok::<Bytes, Infallible>(multipart_chunk(&jpeg));
                            }
                            Ok(Err(e)) => tracing::warn!(slot = slot.as_str(), error = %e, "⚠️ JPEG 编码失败, 跳过该帧"),
                            Err(e) => tracing::warn!(slot = slot.as_str(), error = %e, "⚠️ 编码任务异常, 跳过该帧"),
                        }
                    }
                }

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = updates.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!(slot = slot.as_str(), "推流结束");
        }
    }
}

/// `--frame\r\nContent-Type: image/jpeg\r\n\r\n<jpeg>\r\n`
pub fn multipart_chunk(jpeg: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(jpeg.len() + 64);
    buf.put_slice(b"--");
    buf.put_slice(BOUNDARY.as_bytes());
    buf.put_slice(b"\r\nContent-Type: image/jpeg\r\n\r\n");
    buf.put_slice(jpeg);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::Frame;
    use image::{Rgb, RgbImage};
    use std::future::poll_fn;
    use std::pin::Pin;
    use std::time::Duration;

    type BoxStream = Pin<Box<dyn Stream<Item = Result<Bytes, Infallible>> + Send>>;

    async fn next(stream: &mut BoxStream) -> Option<Bytes> {
        poll_fn(|cx| stream.as_mut().poll_next(cx))
            .await
            .map(|item| item.unwrap_or_else(|never| match never {}))
    }

    async fn next_within(stream: &mut BoxStream, ms: u64) -> Option<Option<Bytes>> {
        tokio::time::timeout(Duration::from_millis(ms), next(stream)).await.ok()
    }

    fn frame(v: u8) -> AnnotatedFrame {
        Frame::new(RgbImage::from_pixel(8, 8, Rgb([v, v, v]))).into()
    }

    fn setup() -> (Arc<FrameStore>, StreamMultiplexer, Shutdown) {
        let store = Arc::new(FrameStore::new());
        let shutdown = Shutdown::new();
        let mux = StreamMultiplexer::new(store.clone(), 80, shutdown.clone());
        (store, mux, shutdown)
    }

    #[test]
    fn test_multipart_chunk_layout() {
        let chunk = multipart_chunk(&[0xFF, 0xD8, 0xFF, 0xD9]);
        assert!(chunk.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xFF\xD8"));
        assert!(chunk.ends_with(b"\xFF\xD9\r\n"));
    }

    #[tokio::test]
    async fn test_waits_for_first_frame() {
        let (store, mux, _shutdown) = setup();
        let mut stream: BoxStream = Box::pin(mux.open_stream(Slot::Motion));

        assert!(next_within(&mut stream, 50).await.is_none());

        store.write_slot(Slot::Motion, frame(10));
        let chunk = next_within(&mut stream, 2000).await.flatten().unwrap();
        assert!(chunk.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xFF\xD8"));
    }

    #[tokio::test]
    async fn test_each_frame_sent_once() {
        let (store, mux, _shutdown) = setup();
        store.write_slot(Slot::Diff, frame(1));
        let mut stream: BoxStream = Box::pin(mux.open_stream(Slot::Diff));
        assert!(next_within(&mut stream, 2000).await.flatten().is_some());

        // 其他槽位更新不会重复发送当前帧
        store.write_slot(Slot::Raw, frame(2));
        assert!(next_within(&mut stream, 50).await.is_none());

        store.write_slot(Slot::Diff, frame(3));
        assert!(next_within(&mut stream, 2000).await.flatten().is_some());
    }

    #[tokio::test]
    async fn test_independent_viewers() {
        let (store, mux, _shutdown) = setup();
        store.write_slot(Slot::Object, frame(5));
        let mut a: BoxStream = Box::pin(mux.open_stream(Slot::Object));
        let mut b: BoxStream = Box::pin(mux.open_stream(Slot::Object));
        let first = next_within(&mut a, 2000).await.flatten().unwrap();
        let second = next_within(&mut b, 2000).await.flatten().unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_shutdown_ends_stream() {
        let (_store, mux, shutdown) = setup();
        let mut stream: BoxStream = Box::pin(mux.open_stream(Slot::Raw));
        shutdown.trigger();
        assert_eq!(next_within(&mut stream, 2000).await, Some(None));
    }

    #[tokio::test]
    async fn test_unencodable_frame_skipped_stream_stays_open() {
        let (store, mux, _shutdown) = setup();
        let empty = RgbImage::new(0, 0);
        assert!(crate::detection::types::encode_jpeg(&empty, 80).is_err());

        store.write_slot(Slot::Motion, Frame::new(empty).into());
        let mut stream: BoxStream = Box::pin(mux.open_stream(Slot::Motion));
        // 编码失败: 不产出数据, 流也没有结束
        assert!(next_within(&mut stream, 100).await.is_none());

        store.write_slot(Slot::Motion, frame(7));
        let chunk = next_within(&mut stream, 2000).await.flatten().unwrap();
        assert!(chunk.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xFF\xD8"));
    }
}
