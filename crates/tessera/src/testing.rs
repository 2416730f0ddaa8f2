//! Deterministic fetcher and spawner for tests.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

use crate::async_runtime::{BoxTask, TaskSpawner};
use crate::error::Error;
use crate::fetch::{FetchFuture, FetchReply, FetchRequest, Fetcher};

/// Route log output through the test harness. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Poll a future that is expected to be immediately ready.
pub fn block_on<F: Future>(f: F) -> F::Output {
    let mut cx = Context::from_waker(Waker::noop());
    let mut f = std::pin::pin!(f);
    match f.as_mut().poll(&mut cx) {
        Poll::Ready(result) => result,
        Poll::Pending => panic!("future unexpectedly pending"),
    }
}

/// Runs tasks on the calling thread.
///
/// By default every task is polled once as soon as it is spawned. A deferred
/// spawner queues tasks until [`InlineSpawner::run_pending`] is called,
/// which lets tests observe resources while their fetch is in flight.
#[derive(Default)]
pub struct InlineSpawner {
    deferred: bool,
    pending: Mutex<Vec<BoxTask>>,
}

impl InlineSpawner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn deferred() -> Arc<Self> {
        Arc::new(Self {
            deferred: true,
            pending: Mutex::default(),
        })
    }

    /// Poll every queued task once, keeping the ones still pending.
    pub fn run_pending(&self) {
        let tasks = std::mem::take(&mut *self.pending.lock());
        let mut cx = Context::from_waker(Waker::noop());
        let mut still_pending = Vec::new();
        for mut task in tasks {
            if task.as_mut().poll(&mut cx).is_pending() {
                still_pending.push(task);
            }
        }
        self.pending.lock().extend(still_pending);
    }
}

impl TaskSpawner for InlineSpawner {
    fn spawn(&self, mut task: BoxTask) {
        if !self.deferred {
            let mut cx = Context::from_waker(Waker::noop());
            if task.as_mut().poll(&mut cx).is_ready() {
                return;
            }
        }
        self.pending.lock().push(task);
    }
}

/// Serves resources from an in-memory table; unknown names answer 404.
#[derive(Default)]
pub struct StaticFetcher {
    content: Mutex<HashMap<String, Vec<u8>>>,
    requests: Mutex<Vec<FetchRequest>>,
}

impl StaticFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, name: &str, data: impl Into<Vec<u8>>) {
        self.content.lock().insert(name.to_string(), data.into());
    }

    /// Names requested so far, in order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().iter().map(|r| r.name.clone()).collect()
    }

    pub fn last_request(&self) -> Option<FetchRequest> {
        self.requests.lock().last().cloned()
    }
}

impl Fetcher for StaticFetcher {
    fn fetch(&self, request: FetchRequest) -> FetchFuture {
        let result = match self.content.lock().get(&request.name) {
            Some(data) => Ok(FetchReply {
                data: data.clone(),
                from_cache: false,
            }),
            None => Err(Error::HttpStatus {
                url: request.name.clone(),
                status: 404,
            }),
        };
        self.requests.lock().push(request);
        Box::pin(async move { result })
    }
}

/// Encode a 256x256 meta tile with every tile set to `flags`, except the
/// listed `(x, y, flags)` overrides.
pub fn meta_tile_png(flags: u8, overrides: &[(u32, u32, u8)]) -> Vec<u8> {
    let mut img = image::GrayImage::from_pixel(256, 256, image::Luma([flags]));
    for &(x, y, f) in overrides {
        img.put_pixel(x, y, image::Luma([f]));
    }
    encode_png(image::DynamicImage::ImageLuma8(img))
}

/// Encode a small RGB texture.
pub fn texture_png(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([10, 20, 30]));
    encode_png(image::DynamicImage::ImageRgb8(img))
}

fn encode_png(img: image::DynamicImage) -> Vec<u8> {
    let mut out = std::io::Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png)
        .expect("png encoding");
    out.into_inner()
}

/// A single triangle OBJ mesh.
pub const TRIANGLE_OBJ: &[u8] = b"v 0 0 0\nv 1 0 0\nv 0 1 0\nvt 0 0\nvt 1 0\nvt 0 1\nf 1/1 2/2 3/3\n";
