//! Readers for the files the `deeppoly` binary consumes: JSON network
//! descriptions, `img{id}_{dataset}_{eps}.txt` spec files and `gt.txt`
//! ground-truth tables.

use anyhow::{anyhow, bail, Context, Result};
use deeppoly_core::{Conv2dSpec, LayerSpec, VerificationSpec};
use ndarray::{Array1, Array2, Array4};
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, info};

/// Layer kinds understood by [`load_network`]; anything else is kept as
/// [`LayerSpec::Unsupported`] so the verifier can name it.
const KNOWN_LAYERS: [&str; 5] = ["flatten", "linear", "conv2d", "relu", "leaky_relu"];

#[derive(Debug, Deserialize)]
struct NetworkFile {
    layers: Vec<serde_json::Value>,
}

/// Layers as written in the JSON file, with nested-list weights.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawLayer {
    Flatten,
    Linear {
        weight: Vec<Vec<f32>>,
        #[serde(default)]
        bias: Option<Vec<f32>>,
    },
    Conv2d {
        weight: Vec<Vec<Vec<Vec<f32>>>>,
        #[serde(default)]
        bias: Option<Vec<f32>>,
        #[serde(default = "unit_stride")]
        stride: (usize, usize),
        #[serde(default)]
        padding: (usize, usize),
    },
    Relu,
    LeakyRelu {
        #[serde(default = "default_negative_slope")]
        negative_slope: f32,
    },
}

fn unit_stride() -> (usize, usize) {
    (1, 1)
}

// Same default as torch.nn.LeakyReLU.
fn default_negative_slope() -> f32 {
    0.01
}

fn matrix(rows: Vec<Vec<f32>>) -> Result<Array2<f32>> {
    let height = rows.len();
    let width = rows.first().map_or(0, Vec::len);
    if let Some(bad) = rows.iter().position(|row| row.len() != width) {
        bail!(
            "ragged weight matrix: row {bad} has {} columns, expected {width}",
            rows[bad].len()
        );
    }
    let flat: Vec<f32> = rows.into_iter().flatten().collect();
    Array2::from_shape_vec((height, width), flat).context("building weight matrix")
}

fn kernel(weight: Vec<Vec<Vec<Vec<f32>>>>) -> Result<Array4<f32>> {
    let out_channels = weight.len();
    let in_channels = weight.first().map_or(0, Vec::len);
    let kernel_h = weight
        .first()
        .and_then(|c| c.first())
        .map_or(0, Vec::len);
    let kernel_w = weight
        .first()
        .and_then(|c| c.first())
        .and_then(|r| r.first())
        .map_or(0, Vec::len);

    let mut flat = Vec::with_capacity(out_channels * in_channels * kernel_h * kernel_w);
    for (o, filter) in weight.into_iter().enumerate() {
        if filter.len() != in_channels {
            bail!("ragged conv kernel: filter {o} has {} input channels", filter.len());
        }
        for (i, plane) in filter.into_iter().enumerate() {
            if plane.len() != kernel_h || plane.iter().any(|row| row.len() != kernel_w) {
                bail!("ragged conv kernel at filter {o}, channel {i}: expected {kernel_h}x{kernel_w}");
            }
            flat.extend(plane.into_iter().flatten());
        }
    }
    Array4::from_shape_vec((out_channels, in_channels, kernel_h, kernel_w), flat)
        .context("building conv kernel")
}

impl RawLayer {
    fn into_spec(self) -> Result<LayerSpec> {
        Ok(match self {
            RawLayer::Flatten => LayerSpec::Flatten,
            RawLayer::Linear { weight, bias } => LayerSpec::Linear {
                weight: matrix(weight)?,
                bias: bias.map(Array1::from),
            },
            RawLayer::Conv2d {
                weight,
                bias,
                stride,
                padding,
            } => LayerSpec::Conv2d(Conv2dSpec {
                weight: kernel(weight)?,
                bias: bias.map(Array1::from),
                stride,
                padding,
            }),
            RawLayer::Relu => LayerSpec::Relu,
            RawLayer::LeakyRelu { negative_slope } => LayerSpec::LeakyRelu { negative_slope },
        })
    }
}

/// Parse a network description of the form `{"layers": [{"type": ..}, ..]}`.
pub fn parse_network(json: &str) -> Result<Vec<LayerSpec>> {
    let file: NetworkFile = serde_json::from_str(json).context("parsing network JSON")?;
    file.layers
        .into_iter()
        .enumerate()
        .map(|(idx, value)| {
            let kind = value
                .get("type")
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| anyhow!("layer {idx} has no \"type\" field"))?
                .to_string();
            if !KNOWN_LAYERS.contains(&kind.as_str()) {
                debug!("Layer {idx} has unknown type {kind:?}");
                return Ok(LayerSpec::Unsupported { kind });
            }
            serde_json::from_value::<RawLayer>(value)
                .with_context(|| format!("layer {idx} ({kind})"))?
                .into_spec()
                .with_context(|| format!("layer {idx} ({kind})"))
        })
        .collect()
}

/// Read and parse a network description file.
pub fn load_network(path: &Path) -> Result<Vec<LayerSpec>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read network {}", path.display()))?;
    let layers = parse_network(&content)
        .with_context(|| format!("failed to load network {}", path.display()))?;
    info!("Loaded {} layers from {}", layers.len(), path.display());
    Ok(layers)
}

/// A parsed `img{id}_{dataset}_{eps}.txt` file.
#[derive(Debug, Clone)]
pub struct SpecFile {
    pub id: usize,
    pub dataset: String,
    pub spec: VerificationSpec,
}

/// Input shape implied by a dataset name; empty means flat.
pub fn dataset_shape(dataset: &str) -> Vec<usize> {
    match dataset {
        "mnist" => vec![1, 28, 28],
        "cifar10" => vec![3, 32, 32],
        _ => Vec::new(),
    }
}

/// Split a spec file name into `(id, dataset, epsilon)`.
pub fn parse_spec_name(path: &Path) -> Result<(usize, String, f32)> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow!("spec path {} has no file name", path.display()))?;
    let malformed = || anyhow!("spec file name {stem:?} is not img{{id}}_{{dataset}}_{{eps}}");

    let rest = stem.strip_prefix("img").ok_or_else(malformed)?;
    let (head, eps) = rest.rsplit_once('_').ok_or_else(malformed)?;
    let (id, dataset) = head.split_once('_').ok_or_else(malformed)?;
    if dataset.is_empty() {
        return Err(malformed());
    }
    let id: usize = id.parse().with_context(|| format!("bad image id {id:?}"))?;
    let epsilon: f32 = eps.parse().with_context(|| format!("bad epsilon {eps:?}"))?;
    Ok((id, dataset.to_string(), epsilon))
}

/// Parse spec file contents: the true label, then comma-separated input values.
pub fn parse_spec_contents(content: &str) -> Result<(usize, Vec<f32>)> {
    let mut lines = content.lines().map(str::trim).filter(|line| !line.is_empty());
    let label = lines
        .next()
        .ok_or_else(|| anyhow!("spec file is empty"))?;
    let label: usize = label
        .parse()
        .with_context(|| format!("bad label {label:?}"))?;
    let values = lines
        .next()
        .ok_or_else(|| anyhow!("spec file has no input line"))?;
    let input = values
        .split(',')
        .map(str::trim)
        .enumerate()
        .map(|(i, v)| {
            v.parse::<f32>()
                .with_context(|| format!("bad input value {i}: {v:?}"))
        })
        .collect::<Result<Vec<f32>>>()?;
    Ok((label, input))
}

/// Read a spec file; ε and the input shape come from its name.
pub fn load_spec(path: &Path) -> Result<SpecFile> {
    let (id, dataset, epsilon) = parse_spec_name(path)?;
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read spec {}", path.display()))?;
    let (label, input) = parse_spec_contents(&content)
        .with_context(|| format!("failed to parse spec {}", path.display()))?;

    let spec = VerificationSpec {
        label,
        input,
        input_shape: dataset_shape(&dataset),
        epsilon,
    };
    // Reject a value count that does not fit the dataset shape up front.
    spec.center()?;
    Ok(SpecFile { id, dataset, spec })
}

/// Look up the expected answer for `(net, spec)` in a `net,spec,answer` table.
///
/// A row matches when its net column equals `net` and its spec column is a
/// substring of `spec`.
pub fn lookup_ground_truth(table: &str, net: &str, spec: &str) -> Result<Option<String>> {
    for (line_no, line) in table.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let [model, file, answer] = fields[..] else {
            bail!("gt.txt line {}: expected net,spec,answer", line_no + 1);
        };
        if model == net && spec.contains(file) {
            return Ok(Some(answer.to_string()));
        }
    }
    Ok(None)
}

/// Expected answer from the `gt.txt` next to `spec_path`.
pub fn ground_truth(net: &str, spec_path: &Path) -> Result<Option<String>> {
    let dir = spec_path.parent().unwrap_or_else(|| Path::new("."));
    let gt_path = dir.join("gt.txt");
    let table = std::fs::read_to_string(&gt_path)
        .with_context(|| format!("failed to read {}", gt_path.display()))?;
    lookup_ground_truth(&table, net, &spec_path.to_string_lossy())
}
