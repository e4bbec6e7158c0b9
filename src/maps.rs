//! The compiler-side representation of kernel maps.
//!
//! A map is a kernel-resident associative container identified by a file
//! descriptor. This crate only models what emission needs: the kind tag, the
//! key/value layout fixed at creation, an optional default for lookup misses
//! and the fd that goes into the map-fd relocation. Creating, populating and
//! closing maps happens outside the workspace.

use crate::types::{Scalar, Ty, Value};
use num_derive::{FromPrimitive, ToPrimitive};
use std::rc::Rc;

/// Map type tags from the kernel ABI.
#[derive(Clone, Copy, PartialEq, Eq, Debug, FromPrimitive, ToPrimitive)]
pub enum MapKind {
    Hash = 1,
    Array = 2,
    ProgArray = 3,
    PerfEventArray = 4,
    PercpuHash = 5,
    PercpuArray = 6,
    StackTrace = 7,
}

/// Deepest stack the kernel will record into a stack-trace map.
pub const PERF_MAX_STACK_DEPTH: u32 = 127;

#[derive(Clone, PartialEq, Debug)]
pub struct MapDef {
    pub kind: MapKind,
    pub key: Ty,
    pub value: Ty,
    pub max_entries: u32,
    pub default: Option<Value>,
}

impl MapDef {
    pub fn hash(key: Ty, value: Ty, max_entries: u32) -> MapDef {
        MapDef {
            kind: MapKind::Hash,
            key,
            value,
            max_entries,
            default: None,
        }
    }

    pub fn array(value: Ty, max_entries: u32) -> MapDef {
        MapDef {
            kind: MapKind::Array,
            key: Ty::Scalar(Scalar::Word),
            value,
            max_entries,
            default: None,
        }
    }

    /// One slot per CPU, both sides a 32-bit fd/index pair.
    pub fn perf_event_array(cpus: u32) -> MapDef {
        MapDef {
            kind: MapKind::PerfEventArray,
            key: Ty::Scalar(Scalar::Word),
            value: Ty::Scalar(Scalar::Word),
            max_entries: cpus,
            default: None,
        }
    }

    pub fn stack_trace(max_entries: u32) -> MapDef {
        MapDef {
            kind: MapKind::StackTrace,
            key: Ty::Scalar(Scalar::Word),
            value: Ty::array_of(Ty::Scalar(Scalar::Quad), PERF_MAX_STACK_DEPTH),
            max_entries,
            default: None,
        }
    }

    /// The value a subscript lookup materializes when the key is absent.
    pub fn with_default(mut self, default: Value) -> MapDef {
        self.default = Some(default);
        self
    }

    pub fn default_value(&self) -> Value {
        self.default
            .clone()
            .unwrap_or_else(|| Value::zero(&self.value))
    }

    pub fn key_size(&self) -> u32 {
        self.key.size()
    }

    pub fn value_size(&self) -> u32 {
        self.value.size()
    }
}

/// A created map: its definition plus the fd embedded at each use site.
#[derive(Clone, PartialEq, Debug)]
pub struct MapHandle {
    pub def: Rc<MapDef>,
    pub fd: i32,
}

impl MapHandle {
    pub fn new(def: MapDef, fd: i32) -> MapHandle {
        MapHandle {
            def: Rc::new(def),
            fd,
        }
    }
}
