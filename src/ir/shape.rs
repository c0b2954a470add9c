//! Tensor shapes: dense arrays of a primitive element type, or tuples of shapes.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PrimitiveType {
    Pred,
    S32,
    U32,
    F16,
    F32,
}

impl PrimitiveType {
    pub fn name(self) -> &'static str {
        match self {
            PrimitiveType::Pred => "pred",
            PrimitiveType::S32 => "s32",
            PrimitiveType::U32 => "u32",
            PrimitiveType::F16 => "f16",
            PrimitiveType::F32 => "f32",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "pred" => Some(PrimitiveType::Pred),
            "s32" => Some(PrimitiveType::S32),
            "u32" => Some(PrimitiveType::U32),
            "f16" => Some(PrimitiveType::F16),
            "f32" => Some(PrimitiveType::F32),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Shape {
    Array {
        element_type: PrimitiveType,
        dims: Vec<i64>,
    },
    Tuple(Vec<Shape>),
}

impl Shape {
    pub fn array(element_type: PrimitiveType, dims: &[i64]) -> Self {
        Shape::Array {
            element_type,
            dims: dims.to_vec(),
        }
    }

    pub fn scalar(element_type: PrimitiveType) -> Self {
        Shape::array(element_type, &[])
    }

    pub fn tuple(elements: Vec<Shape>) -> Self {
        Shape::Tuple(elements)
    }

    pub fn is_tuple(&self) -> bool {
        matches!(self, Shape::Tuple(_))
    }

    /// Element type of an array shape; tuples have none.
    pub fn element_type(&self) -> Option<PrimitiveType> {
        match self {
            Shape::Array { element_type, .. } => Some(*element_type),
            Shape::Tuple(_) => None,
        }
    }

    pub fn dims(&self) -> &[i64] {
        match self {
            Shape::Array { dims, .. } => dims,
            Shape::Tuple(_) => &[],
        }
    }

    pub fn tuple_element(&self, index: usize) -> Option<&Shape> {
        match self {
            Shape::Tuple(elements) => elements.get(index),
            Shape::Array { .. } => None,
        }
    }

    pub fn tuple_element_count(&self) -> usize {
        match self {
            Shape::Tuple(elements) => elements.len(),
            Shape::Array { .. } => 0,
        }
    }

    /// Number of array leaves when the shape is flattened depth first.
    pub fn leaf_count(&self) -> usize {
        match self {
            Shape::Tuple(elements) => elements.iter().map(Shape::leaf_count).sum(),
            Shape::Array { .. } => 1,
        }
    }

    /// Flattened index of the first leaf of tuple element `index`.
    pub fn flat_leaf_offset(&self, index: usize) -> usize {
        match self {
            Shape::Tuple(elements) => elements.iter().take(index).map(Shape::leaf_count).sum(),
            Shape::Array { .. } => 0,
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Array { element_type, dims } => {
                write!(f, "{}[", element_type.name())?;
                for (i, d) in dims.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", d)?;
                }
                write!(f, "]")
            }
            Shape::Tuple(elements) => {
                write!(f, "(")?;
                for (i, e) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", e)?;
                }
                write!(f, ")")
            }
        }
    }
}
