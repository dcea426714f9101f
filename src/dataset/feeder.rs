//! The producer/consumer batching engine.
//!
//! A pool of worker threads shares one cursor into the annotation store,
//! each worker assembling full batches (load, augment, letterbox, encode)
//! and pushing them into a bounded queue. The training loop pulls batches
//! off the queue; the queue's backpressure paces production to consumption.

use crate::config::DatasetConfig;
use crate::dataset::annotations::AnnotationStore;
use crate::dataset::augmentation;
use crate::dataset::label_encoding::LabelEncoder;
use crate::dataset::preprocess;
use crate::dataset::{AnnotationRecord, Bbox};
use crate::error::Error;
use crossbeam_channel::{bounded, Receiver, Sender};
use ndarray::{s, Array3, Array4, Array5};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// One training mini-batch. All samples share the same input resolution;
/// the resolution may differ from batch to batch (multi-scale training).
///
/// `label_mbbox`/`label_lbbox` are `[batch, grid, grid, anchor,
/// 5 + num_classes]` grids for the medium and large stride scale;
/// `mbboxes`/`lbboxes` the per-scale raw center-form boxes
/// `[batch, max_bbox_per_scale, 4]`.
#[derive(Debug)]
pub struct Batch {
    pub images: Array4<f32>,
    pub label_mbbox: Array5<f32>,
    pub label_lbbox: Array5<f32>,
    pub mbboxes: Array3<f32>,
    pub lbboxes: Array3<f32>,
}

/// Annotation ordering plus the read cursor, guarded by one mutex. The
/// lock is held only for the increment and a record clone, never across
/// image I/O or augmentation.
struct StoreState {
    store: AnnotationStore,
    read_index: usize,
}

impl StoreState {
    /// Fetch-then-increment: `num_samples` consecutive calls visit every
    /// index exactly once before wrapping.
    fn next_record(&mut self) -> (usize, AnnotationRecord) {
        let index = self.read_index % self.store.len();
        self.read_index += 1;
        (index, self.store.get(index).clone())
    }

    fn rewind_and_shuffle<R: Rng>(&mut self, rng: &mut R) {
        self.read_index = 0;
        self.store.shuffle(rng);
    }
}

struct Shared {
    config: DatasetConfig,
    encoder: LabelEncoder,
    state: Mutex<StoreState>,
    shutdown: AtomicBool,
    num_samples: usize,
}

/// The feeder owning the worker pool and the batch queue.
///
/// `next_batch` returns `None` once per epoch (after `epoch_size` batches),
/// rewinding the cursor and reshuffling the store; calling it again starts
/// the next epoch. Batches produced from the pre-shuffle ordering that are
/// already queued are delivered, not discarded.
pub struct DataFeeder {
    shared: Arc<Shared>,
    receiver: Receiver<Batch>,
    workers: Vec<JoinHandle<()>>,
    num_batchs: usize,
    delivered: usize,
}

impl DataFeeder {
    pub fn new(config: DatasetConfig) -> Result<DataFeeder, Error> {
        config.validate()?;
        let mut store = AnnotationStore::load(&config.annotation_paths, config.num_classes)?;
        if store.is_empty() {
            return Err(Error::Config("annotation set is empty".into()));
        }
        // first epoch must already be delivered in randomized order
        store.shuffle(&mut rand::thread_rng());
        let num_samples = store.len();
        let num_batchs = (num_samples as f64 / config.batch_size as f64
            * config.sample_rate as f64)
            .ceil() as usize;

        let encoder = LabelEncoder::new(
            config.strides,
            config.anchors.clone(),
            config.anchor_per_scale,
            config.num_classes,
            config.max_bbox_per_scale,
        );
        let (sender, receiver) = bounded(config.queue_capacity);
        let shared = Arc::new(Shared {
            encoder,
            state: Mutex::new(StoreState {
                store,
                read_index: 0,
            }),
            shutdown: AtomicBool::new(false),
            num_samples,
            config,
        });

        let workers = (0..shared.config.workers)
            .map(|worker_id| {
                let shared = shared.clone();
                let sender = sender.clone();
                thread::Builder::new()
                    .name(format!("feeder-worker-{}", worker_id))
                    .spawn(move || worker_loop(shared, sender))
                    .expect("failed to spawn feeder worker thread")
            })
            .collect();

        Ok(DataFeeder {
            shared,
            receiver,
            workers,
            num_batchs,
            delivered: 0,
        })
    }

    /// Blocking pull of the next batch, or `None` at the epoch boundary.
    ///
    /// `None` before [`epoch_size`](DataFeeder::epoch_size) batches have
    /// been delivered means every worker has exited; an error with the
    /// cause is logged by the exiting workers, and the feeder stays dry
    /// from then on.
    pub fn next_batch(&mut self) -> Option<Batch> {
        if self.delivered < self.num_batchs {
            match self.receiver.recv() {
                Ok(batch) => {
                    self.delivered += 1;
                    Some(batch)
                }
                Err(_) => {
                    log::error!("every producer worker has exited, feeder is dry");
                    None
                }
            }
        } else {
            self.shared
                .state
                .lock()
                .unwrap()
                .rewind_and_shuffle(&mut rand::thread_rng());
            self.delivered = 0;
            None
        }
    }

    /// Number of batches per epoch: `ceil(num_samples / batch_size * sample_rate)`.
    pub fn epoch_size(&self) -> usize {
        self.num_batchs
    }

    /// Number of annotation records backing the feeder.
    pub fn dataset_size(&self) -> usize {
        self.shared.num_samples
    }
}

impl Iterator for DataFeeder {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        self.next_batch()
    }
}

impl Drop for DataFeeder {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        // drain the queue until every worker has observed the flag, so no
        // sender stays blocked on a full queue
        while self.workers.iter().any(|worker| !worker.is_finished()) {
            for _ in self.receiver.try_iter() {}
            thread::sleep(Duration::from_millis(5));
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: Arc<Shared>, sender: Sender<Batch>) {
    let mut rng = StdRng::from_entropy();
    while !shared.shutdown.load(Ordering::Relaxed) {
        match produce_batch(&shared, &mut rng) {
            Ok(batch) => {
                // send fails only when the consumer side is gone
                if sender.send(batch).is_err() {
                    break;
                }
            }
            Err(err) => {
                // only a full fruitless pass over the store ends up here;
                // per-sample failures are skipped inside produce_batch
                log::error!("batch production failed, worker exiting: {}", err);
                break;
            }
        }
    }
}

/// Assembles one full batch at a single randomly chosen input resolution.
/// Broken samples are logged and skipped by drawing the next cursor
/// position; a full fruitless pass over the store aborts the attempt.
fn produce_batch(shared: &Shared, rng: &mut StdRng) -> Result<Batch, Error> {
    let config = &shared.config;
    let input_size = config.input_sizes[rng.gen_range(0..config.input_sizes.len())];
    let output_sizes = [
        (input_size / config.strides[0]) as usize,
        (input_size / config.strides[1]) as usize,
    ];
    let features = 5 + config.num_classes;

    let mut images = Array4::<f32>::zeros((
        config.batch_size,
        input_size as usize,
        input_size as usize,
        config.channels,
    ));
    let mut label_mbbox = Array5::<f32>::zeros((
        config.batch_size,
        output_sizes[0],
        output_sizes[0],
        config.anchor_per_scale,
        features,
    ));
    let mut label_lbbox = Array5::<f32>::zeros((
        config.batch_size,
        output_sizes[1],
        output_sizes[1],
        config.anchor_per_scale,
        features,
    ));
    let mut mbboxes = Array3::<f32>::zeros((config.batch_size, config.max_bbox_per_scale, 4));
    let mut lbboxes = Array3::<f32>::zeros((config.batch_size, config.max_bbox_per_scale, 4));

    let mut slot = 0;
    let mut consecutive_failures = 0;
    while slot < config.batch_size {
        let (_, record) = shared.state.lock().unwrap().next_record();
        match load_sample(shared, &record, input_size, rng) {
            Ok((tensor, boxes)) => {
                images.slice_mut(s![slot, .., .., ..]).assign(&tensor);
                let encoded = shared.encoder.encode(&boxes, output_sizes);
                label_mbbox
                    .slice_mut(s![slot, .., .., .., ..])
                    .assign(&encoded.label_mbbox);
                label_lbbox
                    .slice_mut(s![slot, .., .., .., ..])
                    .assign(&encoded.label_lbbox);
                mbboxes.slice_mut(s![slot, .., ..]).assign(&encoded.mbboxes);
                lbboxes.slice_mut(s![slot, .., ..]).assign(&encoded.lbboxes);
                slot += 1;
                consecutive_failures = 0;
            }
            Err(err) => {
                log::warn!(
                    "skipping sample {}: {}",
                    record.image_path.display(),
                    err
                );
                consecutive_failures += 1;
                if consecutive_failures >= shared.num_samples {
                    return Err(Error::NoUsableSamples);
                }
            }
        }
    }

    Ok(Batch {
        images,
        label_mbbox,
        label_lbbox,
        mbboxes,
        lbboxes,
    })
}

fn load_sample(
    shared: &Shared,
    record: &AnnotationRecord,
    input_size: u32,
    rng: &mut StdRng,
) -> Result<(Array3<f32>, Vec<Bbox>), Error> {
    let image = preprocess::load_image(&record.image_path)?;
    let (image, boxes) = if shared.config.augment {
        augmentation::augment(rng, image, record.boxes.clone())
    } else {
        (image, record.boxes.clone())
    };
    Ok(preprocess::letterbox(
        &image,
        input_size,
        &boxes,
        shared.config.channels,
    ))
}
