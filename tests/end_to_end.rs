use std::cell::Cell;
use std::net::TcpListener;
use std::path::{Path, PathBuf};

use polisher::data::{GenomicPosition, ImageShape, Rank, SequenceMeta, Tensor3};
use polisher::error::FailureKind;
use polisher::io::checkpoint::write_checkpoint;
use polisher::io::images::ImageFileWriter;
use polisher::io::predictions::{output_path, partial_path, read_predictions, Prediction};
use polisher::io::window::{EdgePolicy, WindowParams};
use polisher::model::{ElmanTransducer, HiddenState, ModelArch, ModelMeta, SequenceModel, StepOutput};
use polisher::pipelines::group::RendezvousConfig;
use polisher::pipelines::shard::{Device, ShardAssignment};
use polisher::pipelines::worker::{run_worker, run_worker_with_model, WorkerSpec};
use polisher::utils::progress::NullReporter;
use polisher::{PolishError, Result};

// --- Helpers ---

/// Writes image containers with deterministic content
struct SyntheticImageBuilder {
    shape: ImageShape,
    contig: String,
    n_records: u32,
    first_chunk: u32,
}

impl SyntheticImageBuilder {
    fn new(shape: ImageShape, n_records: u32) -> Self {
        Self {
            shape,
            contig: "contig_1".to_string(),
            n_records,
            first_chunk: 0,
        }
    }

    fn contig(mut self, contig: &str) -> Self {
        self.contig = contig.to_string();
        self
    }

    fn first_chunk(mut self, chunk: u32) -> Self {
        self.first_chunk = chunk;
        self
    }

    fn build(self, path: &Path) -> PathBuf {
        let mut w = ImageFileWriter::create(path, self.shape).unwrap();
        for c in self.first_chunk..self.first_chunk + self.n_records {
            let start = c as u64 * self.shape.seq_len as u64;
            let meta = SequenceMeta {
                contig: self.contig.clone(),
                contig_start: start,
                contig_end: start + self.shape.seq_len as u64,
                chunk_id: c,
                positions: (0..self.shape.seq_len as u64)
                    .map(|p| GenomicPosition::new(start + p, 0))
                    .collect(),
                filename: String::new(),
            };
            let pixels: Vec<u8> = (0..self.shape.n_pixels())
                .map(|p| ((p * 31 + c as usize * 17) % 251) as u8)
                .collect();
            w.push(&meta, &pixels).unwrap();
        }
        w.finish().unwrap();
        path.to_path_buf()
    }
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

fn spec(dir: &Path, world_size: usize, window: WindowParams, arch: ModelArch) -> WorkerSpec {
    WorkerSpec {
        world_size,
        output_prefix: dir.join("preds"),
        model_path: dir.join("model.ckpt"),
        batch_size: 2,
        loader_threads: 2,
        window,
        arch,
        rendezvous: RendezvousConfig {
            addr: ([127, 0, 0, 1], free_port()).into(),
            join_timeout_secs: 20,
        },
    }
}

/// Emits scripted one-hot logits per window.
///
/// The hidden state counts the windows seen so far, so the script row used
/// for a call is only right if the carry is threaded between calls.
struct ScriptedModel {
    arch: ModelArch,
    meta: ModelMeta,
    /// Per window: (strength, base class per local position, rle class per local position)
    script: Vec<(f32, Vec<usize>, Vec<usize>)>,
    calls: Cell<usize>,
    fail_on_call: Option<usize>,
}

impl ScriptedModel {
    fn new(arch: ModelArch, script: Vec<(f32, Vec<usize>, Vec<usize>)>) -> Self {
        Self {
            arch,
            meta: ModelMeta {
                hidden_size: 1,
                gru_layers: 1,
                iteration: 0,
            },
            script,
            calls: Cell::new(0),
            fail_on_call: None,
        }
    }
}

impl SequenceModel for ScriptedModel {
    fn arch(&self) -> &ModelArch {
        &self.arch
    }

    fn meta(&self) -> &ModelMeta {
        &self.meta
    }

    fn step(&self, window: &Tensor3, hidden: HiddenState) -> Result<StepOutput> {
        let call = self.calls.get();
        self.calls.set(call + 1);
        if self.fail_on_call == Some(call) {
            return Err(PolishError::inference("scripted model failure"));
        }
        let [batch, width, _] = window.dims();
        let mut h = hidden.into_tensor();
        let seen = h.row(0, 0)[0] as usize;
        let (strength, base, rle) = &self.script[seen.min(self.script.len() - 1)];

        let mut base_logits = Tensor3::zeros([batch, width, self.arch.base_classes]);
        let mut rle_logits = Tensor3::zeros([batch, width, self.arch.rle_classes]);
        for i in 0..batch {
            for t in 0..width {
                base_logits.row_mut(i, t)[base[t]] = *strength;
                rle_logits.row_mut(i, t)[rle[t]] = *strength;
            }
        }
        for v in h.data_mut() {
            *v += 1.0;
        }
        Ok(StepOutput {
            base_logits,
            rle_logits,
            hidden: HiddenState::from_tensor(h),
        })
    }
}

fn scripted_arch(seq_len: usize) -> ModelArch {
    ModelArch {
        channels: 1,
        image_height: 2,
        seq_len,
        base_classes: 5,
        rle_classes: 6,
    }
}

/// Window 0 is weak, window 1 is strong and overrides it where they overlap
fn two_window_script() -> Vec<(f32, Vec<usize>, Vec<usize>)> {
    vec![
        (4.0, vec![1, 2, 3, 4], vec![0, 1, 2, 3]),
        (6.0, vec![1, 1, 2, 3], vec![5, 5, 4, 4]),
    ]
}

fn run_single(dir: &Path, files: Vec<PathBuf>, spec: &WorkerSpec, model: impl SequenceModel) -> Result<Vec<Prediction>> {
    let assignment = ShardAssignment::new(vec![files], vec![Device::Cpu(0)])?;
    let report = run_worker_with_model(Rank(0), &assignment, spec, model, &mut NullReporter)?;
    assert_eq!(report.output, output_path(&dir.join("preds"), Rank(0)));
    read_predictions(&report.output)
}

// --- Tests ---

#[test]
fn test_hand_computed_two_windows() {
    // L=6, W=4, J=2: windows [0,4) and [2,6)
    let dir = tempfile::tempdir().unwrap();
    let arch = scripted_arch(6);
    let window = WindowParams {
        seq_len: 6,
        width: 4,
        jump: 2,
        edge_policy: EdgePolicy::Drop,
    };
    let spec = spec(dir.path(), 1, window, arch);
    let file = SyntheticImageBuilder::new(arch.image_shape(), 3).build(&dir.path().join("a.img"));

    let preds = run_single(dir.path(), vec![file], &spec, ScriptedModel::new(arch, two_window_script())).unwrap();
    assert_eq!(preds.len(), 3);
    for (c, p) in preds.iter().enumerate() {
        assert_eq!(p.chunk_id, c as u32);
        assert_eq!(p.filename, "a.img");
        assert_eq!(p.contig_start, c as u64 * 6);
        // pos 0,1 from window 0; 2,3 overlap and window 1 dominates; 4,5 from window 1
        assert_eq!(p.base_symbols(), "ACAACG");
        assert_eq!(p.rle, vec![0, 1, 5, 5, 4, 4]);
    }
}

#[test]
fn test_uncovered_tail_resolves_to_class_zero() {
    // L=7 leaves position 6 outside every window under the drop policy
    let dir = tempfile::tempdir().unwrap();
    let arch = scripted_arch(7);
    let mut window = WindowParams {
        seq_len: 7,
        width: 4,
        jump: 2,
        edge_policy: EdgePolicy::Drop,
    };
    let file = SyntheticImageBuilder::new(arch.image_shape(), 1).build(&dir.path().join("a.img"));

    let spec_drop = spec(dir.path(), 1, window, arch);
    let preds = run_single(dir.path(), vec![file.clone()], &spec_drop, ScriptedModel::new(arch, two_window_script())).unwrap();
    assert_eq!(preds[0].base_symbols(), "ACAACG_");
    assert_eq!(preds[0].rle, vec![0, 1, 5, 5, 4, 4, 0]);

    // Clip adds a third window [3,7), scripted like window 1
    window.edge_policy = EdgePolicy::Clip;
    let spec_clip = spec(dir.path(), 1, window, arch);
    let preds = run_single(dir.path(), vec![file], &spec_clip, ScriptedModel::new(arch, two_window_script())).unwrap();
    assert_eq!(preds[0].base.len(), 7);
    assert_eq!(preds[0].base[6], 3);
    assert_eq!(preds[0].rle[6], 4);
}

#[test]
fn test_inference_failure_leaves_no_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let arch = scripted_arch(6);
    let window = WindowParams {
        seq_len: 6,
        width: 4,
        jump: 2,
        edge_policy: EdgePolicy::Drop,
    };
    let spec = spec(dir.path(), 1, window, arch);
    // 5 records at batch size 2: the third call is the first window of batch 2
    let file = SyntheticImageBuilder::new(arch.image_shape(), 5).build(&dir.path().join("a.img"));
    let mut model = ScriptedModel::new(arch, two_window_script());
    model.fail_on_call = Some(2);

    let assignment = ShardAssignment::new(vec![vec![file]], vec![Device::Cpu(0)]).unwrap();
    let err = run_worker_with_model(Rank(0), &assignment, &spec, model, &mut NullReporter).unwrap_err();
    assert_eq!(err.kind(), FailureKind::Inference);
    assert_eq!(err.exit_code(), 3);

    let final_path = output_path(&spec.output_prefix, Rank(0));
    assert!(!final_path.exists());
    assert!(partial_path(&final_path).exists());
}

#[test]
fn test_failed_rerun_removes_previous_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let arch = scripted_arch(6);
    let window = WindowParams {
        seq_len: 6,
        width: 4,
        jump: 2,
        edge_policy: EdgePolicy::Drop,
    };
    let spec = spec(dir.path(), 1, window, arch);
    let file = SyntheticImageBuilder::new(arch.image_shape(), 5).build(&dir.path().join("a.img"));

    let preds = run_single(dir.path(), vec![file.clone()], &spec, ScriptedModel::new(arch, two_window_script())).unwrap();
    assert_eq!(preds.len(), 5);
    let final_path = output_path(&spec.output_prefix, Rank(0));
    assert!(final_path.exists());

    // Same prefix again, failing in the second batch
    let mut model = ScriptedModel::new(arch, two_window_script());
    model.fail_on_call = Some(2);
    let assignment = ShardAssignment::new(vec![vec![file]], vec![Device::Cpu(0)]).unwrap();
    let err = run_worker_with_model(Rank(0), &assignment, &spec, model, &mut NullReporter).unwrap_err();
    assert_eq!(err.kind(), FailureKind::Inference);
    assert!(!final_path.exists());
    assert!(partial_path(&final_path).exists());
}

#[test]
fn test_checkpoint_model_matches_in_memory_model() {
    let dir = tempfile::tempdir().unwrap();
    let arch = ModelArch {
        channels: 2,
        image_height: 3,
        seq_len: 12,
        base_classes: 5,
        rle_classes: 7,
    };
    let meta = ModelMeta {
        hidden_size: 8,
        gru_layers: 1,
        iteration: 3,
    };
    let window = WindowParams {
        seq_len: 12,
        width: 5,
        jump: 3,
        edge_policy: EdgePolicy::Clip,
    };
    let model = ElmanTransducer::random(arch, meta, 77);
    let spec = spec(dir.path(), 1, window, arch);
    write_checkpoint(&spec.model_path, &model).unwrap();
    let file = SyntheticImageBuilder::new(arch.image_shape(), 3).build(&dir.path().join("a.img"));
    let assignment = ShardAssignment::new(vec![vec![file.clone()]], vec![Device::Cpu(0)]).unwrap();

    let report = run_worker(Rank(0), &assignment, &spec).unwrap();
    assert_eq!(report.n_instances, 3);
    assert_eq!(report.n_batches, 2);
    let from_checkpoint = read_predictions(&report.output).unwrap();

    let in_memory = run_single(dir.path(), vec![file], &spec, &model).unwrap();
    assert_eq!(from_checkpoint, in_memory);
}

#[test]
fn test_startup_failures() {
    let dir = tempfile::tempdir().unwrap();
    let arch = scripted_arch(6);
    let window = WindowParams {
        seq_len: 6,
        width: 4,
        jump: 2,
        edge_policy: EdgePolicy::Drop,
    };
    let file = SyntheticImageBuilder::new(arch.image_shape(), 1).build(&dir.path().join("a.img"));

    // Missing checkpoint
    let spec = spec(dir.path(), 1, window, arch);
    let assignment = ShardAssignment::new(vec![vec![file.clone()]], vec![Device::Cpu(0)]).unwrap();
    let err = run_worker(Rank(0), &assignment, &spec).unwrap_err();
    assert_eq!(err.kind(), FailureKind::Startup);

    // Checkpoint for another architecture
    let mut other = arch;
    other.rle_classes = 9;
    let meta = ModelMeta {
        hidden_size: 2,
        gru_layers: 1,
        iteration: 0,
    };
    write_checkpoint(&spec.model_path, &ElmanTransducer::random(other, meta, 1)).unwrap();
    let err = run_worker(Rank(0), &assignment, &spec).unwrap_err();
    assert_eq!(err.kind(), FailureKind::Startup);

    // Device that does not exist in this build
    let gpu = ShardAssignment::new(vec![vec![file]], vec!["cuda:0".parse().unwrap()]).unwrap();
    let err = run_worker_with_model(Rank(0), &gpu, &spec, ScriptedModel::new(arch, two_window_script()), &mut NullReporter)
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::Startup);
}

#[test]
fn test_two_workers_cover_input_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let arch = ModelArch {
        channels: 1,
        image_height: 4,
        seq_len: 10,
        base_classes: 5,
        rle_classes: 4,
    };
    let meta = ModelMeta {
        hidden_size: 4,
        gru_layers: 1,
        iteration: 0,
    };
    let window = WindowParams {
        seq_len: 10,
        width: 4,
        jump: 2,
        edge_policy: EdgePolicy::Drop,
    };
    let spec = spec(dir.path(), 2, window, arch);
    write_checkpoint(&spec.model_path, &ElmanTransducer::random(arch, meta, 5)).unwrap();

    let files: Vec<PathBuf> = (0..3)
        .map(|f| {
            SyntheticImageBuilder::new(arch.image_shape(), 2)
                .contig(&format!("contig_{}", f))
                .first_chunk(f * 10)
                .build(&dir.path().join(format!("part_{}.img", f)))
        })
        .collect();
    let assignment = ShardAssignment::partition(&files, vec![Device::Cpu(0), Device::Cpu(1)]).unwrap();

    let handles: Vec<_> = (0..2u32)
        .map(|r| {
            let assignment = assignment.clone();
            let spec = spec.clone();
            std::thread::spawn(move || run_worker(Rank(r), &assignment, &spec))
        })
        .collect();
    let reports: Vec<_> = handles.into_iter().map(|h| h.join().unwrap().unwrap()).collect();
    assert_eq!(reports[0].n_files + reports[1].n_files, 3);

    let mut seen: Vec<(String, u32)> = Vec::new();
    for r in 0..2 {
        let path = output_path(&spec.output_prefix, Rank(r));
        for p in read_predictions(&path).unwrap() {
            seen.push((p.contig, p.chunk_id));
        }
    }
    seen.sort();
    let expected: Vec<(String, u32)> = (0..3u32)
        .flat_map(|f| (0..2).map(move |c| (format!("contig_{}", f), f * 10 + c)))
        .collect();
    assert_eq!(seen, expected);
}
