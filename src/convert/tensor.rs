use crate::error::{ConvertError, Result};

/// A dense row-major f32 tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(ConvertError::ShapeMismatch(format!(
                "shape {:?} holds {} values, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn element_count(&self) -> usize {
        self.data.len()
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn leading_dim(&self) -> usize {
        self.shape.first().copied().unwrap_or(1)
    }

    /// Size of one slice along the leading dimension.
    fn row_len(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    /// Rows `start..end` along the leading dimension, as a new tensor.
    pub fn slice_rows(&self, start: usize, end: usize) -> Self {
        let row_len = self.row_len();
        let mut shape = self.shape.clone();
        if let Some(first) = shape.first_mut() {
            *first = end - start;
        }
        Self {
            shape,
            data: self.data[start * row_len..end * row_len].to_vec(),
        }
    }

    /// Swaps rows and columns. Vectors and scalars come back unchanged; tensors of rank
    /// 3 or more have no transpose and yield `None`.
    pub fn transpose(&self) -> Option<Self> {
        match self.shape.len() {
            0 | 1 => return Some(self.clone()),
            2 => {}
            _ => return None,
        }

        let rows = self.shape[0];
        let cols = self.shape[1];
        let mut transposed = vec![0.0f32; self.data.len()];

        for i in 0..rows {
            for j in 0..cols {
                transposed[j * rows + i] = self.data[i * cols + j];
            }
        }

        Some(Self {
            shape: vec![cols, rows],
            data: transposed,
        })
    }
}
