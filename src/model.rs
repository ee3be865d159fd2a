use std::fs::File;
use std::io::Read;
use std::path::Path;

use image::imageops::FilterType;
use tensorflow::{
    Graph, ImportGraphDefOptions, Session, SessionOptions, SessionRunArgs, Status, Tensor,
};
use thiserror::Error;
use tracing::debug;

const INPUT_HEIGHT: u32 = 64;

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("model file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tensorflow error: {0}")]
    Tensorflow(String),
    #[error("operation '{0}' not found in graph")]
    MissingOperation(String),
    #[error("classifier could not read image: {0}")]
    Image(#[from] image::ImageError),
    #[error("malformed charset: {0}")]
    Charset(String),
    #[error("unexpected output shape {0:?}")]
    OutputShape(Vec<u64>),
}

impl From<Status> for ClassifierError {
    fn from(status: Status) -> Self {
        ClassifierError::Tensorflow(status.to_string())
    }
}

impl From<std::ffi::NulError> for ClassifierError {
    fn from(err: std::ffi::NulError) -> Self {
        ClassifierError::Tensorflow(err.to_string())
    }
}

/// Turns an encoded captcha image into the text it shows.
pub trait Classifier: Send {
    fn classify(&self, image_data: &[u8]) -> Result<String, ClassifierError>;
}

/// Class labels of a CTC model. Index 0 is the blank.
#[derive(Debug, Clone, PartialEq)]
pub struct Charset(Vec<String>);

impl Charset {
    /// Reads a JSON array of labels from `*.json` files, one label per line otherwise.
    pub fn load(path: &Path) -> Result<Self, ClassifierError> {
        let contents = std::fs::read_to_string(path)?;
        let labels: Vec<String> = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&contents).map_err(|e| ClassifierError::Charset(e.to_string()))?
        } else {
            contents.lines().map(String::from).collect()
        };

        if labels.is_empty() {
            return Err(ClassifierError::Charset(format!(
                "{} contains no labels",
                path.display()
            )));
        }
        Ok(Charset(labels))
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }
}

impl From<Vec<String>> for Charset {
    fn from(labels: Vec<String>) -> Self {
        Charset(labels)
    }
}

/// CTC text recognizer backed by a frozen TensorFlow graph.
pub struct TfClassifier {
    session: Session,
    graph: Graph,
    charset: Charset,
    input_op: String,
    output_op: String,
}

impl TfClassifier {
    pub fn new(
        model_path: &Path,
        charset: Charset,
        input_op: &str,
        output_op: &str,
    ) -> Result<Self, ClassifierError> {
        let mut graph = Graph::new();
        let mut model_file = File::open(model_path)?;
        let mut model_bytes = Vec::new();
        model_file.read_to_end(&mut model_bytes)?;

        graph.import_graph_def(&model_bytes, &ImportGraphDefOptions::new())?;

        let session = Session::new(&SessionOptions::new(), &graph)?;

        Ok(TfClassifier {
            session,
            graph,
            charset,
            input_op: input_op.to_string(),
            output_op: output_op.to_string(),
        })
    }

    fn input_tensor(&self, image_data: &[u8]) -> Result<Tensor<f32>, ClassifierError> {
        let img = image::load_from_memory(image_data)?;
        let width = scaled_width(img.width(), img.height());
        let gray = img
            .resize_exact(width, INPUT_HEIGHT, FilterType::Lanczos3)
            .to_luma8();

        let values: Vec<f32> = gray.pixels().map(|p| normalize(p.0[0])).collect();
        let mut tensor = Tensor::new(&[1, 1, INPUT_HEIGHT as u64, width as u64]);
        tensor.copy_from_slice(&values);

        Ok(tensor)
    }

    fn operation(&self, name: &str) -> Result<tensorflow::Operation, ClassifierError> {
        self.graph
            .operation_by_name(name)?
            .ok_or_else(|| ClassifierError::MissingOperation(name.to_string()))
    }
}

impl Classifier for TfClassifier {
    fn classify(&self, image_data: &[u8]) -> Result<String, ClassifierError> {
        let input_tensor = self.input_tensor(image_data)?;

        let input_operation = self.operation(&self.input_op)?;
        let output_operation = self.operation(&self.output_op)?;

        let mut args = SessionRunArgs::new();
        args.add_feed(&input_operation, 0, &input_tensor);
        let output_token = args.request_fetch(&output_operation, 0);
        self.session.run(&mut args)?;
        let output_tensor: Tensor<f32> = args.fetch(output_token)?;

        let dims = output_tensor.dims().to_vec();
        let classes = match dims.last() {
            Some(&c) if c > 0 => c as usize,
            _ => return Err(ClassifierError::OutputShape(dims)),
        };
        debug!(?dims, "classifier output");

        Ok(ctc_greedy_decode(&output_tensor, classes, &self.charset))
    }
}

/// Width after scaling to the model's input height, keeping aspect ratio.
fn scaled_width(width: u32, height: u32) -> u32 {
    let scaled = width as u64 * INPUT_HEIGHT as u64 / height.max(1) as u64;
    scaled.clamp(1, u32::MAX as u64) as u32
}

/// Maps a pixel into `[-1, 1]`.
fn normalize(value: u8) -> f32 {
    (value as f32 / 255.0 - 0.5) / 0.5
}

/// Best class per timestep, repeats merged, blanks dropped.
fn ctc_greedy_decode(logits: &[f32], classes: usize, charset: &Charset) -> String {
    let mut text = String::new();
    let mut previous = None;

    for step in logits.chunks_exact(classes) {
        // first index wins on ties
        let best = step
            .iter()
            .enumerate()
            .fold(None, |best: Option<(usize, f32)>, (i, &v)| match best {
                Some((_, top)) if v <= top => best,
                _ => Some((i, v)),
            })
            .map(|(i, _)| i);

        if best == previous {
            continue;
        }
        previous = best;

        match best {
            Some(0) | None => {}
            Some(i) => {
                if let Some(label) = charset.get(i) {
                    text.push_str(label);
                }
            }
        }
    }

    text
}
