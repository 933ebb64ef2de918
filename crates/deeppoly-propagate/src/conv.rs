//! 2-D convolution lowered to an equivalent dense layer.
//!
//! Inputs are `(channels, height, width)` tensors flattened row-major, so the
//! neuron index of `(c, y, x)` is `c·H·W + y·W + x`. The same encoding is used
//! for the output.

use crate::transformers::LinearTransformer;
use deeppoly_core::{Conv2dSpec, PolyError, Result};
use ndarray::{Array1, Array2};

/// Output size along one spatial axis: `(input + 2·pad - kernel) / stride + 1`.
pub fn output_size(input: usize, kernel: usize, stride: usize, padding: usize) -> Result<usize> {
    if stride == 0 {
        return Err(PolyError::InvalidNetwork("convolution stride must be > 0".to_string()));
    }
    if kernel == 0 {
        return Err(PolyError::InvalidNetwork("convolution kernel is empty".to_string()));
    }
    let padded = input + 2 * padding;
    if kernel > padded {
        return Err(PolyError::InvalidNetwork(format!(
            "kernel size {kernel} exceeds padded input size {padded}"
        )));
    }
    Ok((padded - kernel) / stride + 1)
}

/// A convolution bound to a concrete input shape.
#[derive(Debug, Clone)]
pub struct Conv2dLayer {
    spec: Conv2dSpec,
    /// (channels, height, width)
    input_shape: [usize; 3],
    /// (channels, height, width)
    output_shape: [usize; 3],
}

impl Conv2dLayer {
    pub fn new(spec: Conv2dSpec, input_shape: [usize; 3]) -> Result<Self> {
        let [channels, height, width] = input_shape;
        if spec.in_channels() != channels {
            return Err(PolyError::shape_mismatch(
                vec![spec.in_channels()],
                vec![channels],
            ));
        }
        if let Some(bias) = &spec.bias {
            if bias.len() != spec.out_channels() {
                return Err(PolyError::shape_mismatch(
                    vec![spec.out_channels()],
                    vec![bias.len()],
                ));
            }
        }
        let (kernel_h, kernel_w) = spec.kernel_size();
        let out_h = output_size(height, kernel_h, spec.stride.0, spec.padding.0)?;
        let out_w = output_size(width, kernel_w, spec.stride.1, spec.padding.1)?;
        let output_shape = [spec.out_channels(), out_h, out_w];
        Ok(Self {
            spec,
            input_shape,
            output_shape,
        })
    }

    pub fn output_shape(&self) -> [usize; 3] {
        self.output_shape
    }

    /// Build the dense `(out_len, in_len)` weight matrix and bias.
    ///
    /// Taps that land in the padding contribute nothing.
    pub fn to_dense(&self) -> (Array2<f32>, Array1<f32>) {
        let [in_c, in_h, in_w] = self.input_shape;
        let [out_c, out_h, out_w] = self.output_shape;
        let (kernel_h, kernel_w) = self.spec.kernel_size();
        let (stride_h, stride_w) = self.spec.stride;
        let (pad_h, pad_w) = self.spec.padding;

        let mut weight = Array2::zeros((out_c * out_h * out_w, in_c * in_h * in_w));
        let mut bias = Array1::zeros(out_c * out_h * out_w);

        for oc in 0..out_c {
            let channel_bias = self.spec.bias.as_ref().map_or(0.0, |b| b[oc]);
            for oy in 0..out_h {
                for ox in 0..out_w {
                    let row = (oc * out_h + oy) * out_w + ox;
                    bias[row] = channel_bias;
                    for ic in 0..in_c {
                        for ky in 0..kernel_h {
                            // Signed arithmetic: the tap may fall into the top/left padding.
                            let iy = (oy * stride_h + ky) as isize - pad_h as isize;
                            if iy < 0 || iy >= in_h as isize {
                                continue;
                            }
                            for kx in 0..kernel_w {
                                let ix = (ox * stride_w + kx) as isize - pad_w as isize;
                                if ix < 0 || ix >= in_w as isize {
                                    continue;
                                }
                                let col = (ic * in_h + iy as usize) * in_w + ix as usize;
                                weight[[row, col]] += self.spec.weight[[oc, ic, ky, kx]];
                            }
                        }
                    }
                }
            }
        }
        (weight, bias)
    }

    /// The dense layer equivalent to this convolution.
    pub fn to_linear(&self) -> Result<LinearTransformer> {
        let (weight, bias) = self.to_dense();
        LinearTransformer::new(weight, Some(bias))
    }
}
