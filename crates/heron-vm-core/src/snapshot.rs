//! Heap snapshots.
//!
//! A JSON dump of the live heap: one node per cell, one edge per owning
//! pointer, string contents, and summary metadata. Written through the
//! metadata descriptor table, so embedder-registered kinds are covered
//! without extra wiring.

use std::io::Write;

use heron_vm_heap::cell::{CellPtr, metadata_for, visit_cell};
use heron_vm_heap::roots::SlotAcceptor;
use heron_vm_heap::string::StringCell;
use heron_vm_heap::value::{SymbolId, Value};
use serde::Serialize;

use crate::kinds::CellKind;
use crate::runtime::Runtime;

#[derive(Serialize)]
struct Snapshot {
    meta: Meta,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    strings: Vec<StringRecord>,
}

#[derive(Serialize)]
struct Meta {
    node_count: usize,
    edge_count: usize,
    heap_bytes: usize,
}

#[derive(Serialize)]
struct Node {
    id: usize,
    kind: &'static str,
    size: usize,
}

#[derive(Serialize)]
struct Edge {
    from: usize,
    to: usize,
}

#[derive(Serialize)]
struct StringRecord {
    id: usize,
    content: String,
}

struct EdgeCollector<'a> {
    from: usize,
    edges: &'a mut Vec<Edge>,
}

impl SlotAcceptor for EdgeCollector<'_> {
    unsafe fn value_slot(&mut self, slot: *mut Value) {
        // SAFETY: snapshotting only reads.
        if let Some(cell) = unsafe { *slot }.pointer() {
            self.edges.push(Edge {
                from: self.from,
                to: cell.addr(),
            });
        }
    }

    unsafe fn ptr_slot(&mut self, slot: *mut Option<CellPtr>) {
        // SAFETY: as above.
        if let Some(cell) = unsafe { *slot } {
            self.edges.push(Edge {
                from: self.from,
                to: cell.addr(),
            });
        }
    }

    fn symbol(&mut self, _sym: SymbolId) {}
}

/// Serialize the live heap as JSON.
pub fn write_heap_snapshot<W: Write>(rt: &Runtime, writer: &mut W) -> std::io::Result<()> {
    let mut nodes = Vec::new();
    let mut edges = Vec::new();
    let mut strings = Vec::new();
    let mut heap_bytes = 0usize;

    rt.heap().for_each_cell(|cell| {
        // SAFETY: for_each_cell yields live cells.
        let header = unsafe { cell.header() };
        let size = header.size();
        heap_bytes += size;
        nodes.push(Node {
            id: cell.addr(),
            kind: metadata_for(header.kind()).name,
            size,
        });
        if header.kind() == CellKind::String as u8 {
            // SAFETY: kind checked.
            let content = unsafe { (*cell.cast::<StringCell>()).as_str() };
            const CAP: usize = 256;
            strings.push(StringRecord {
                id: cell.addr(),
                content: content.chars().take(CAP).collect(),
            });
        }
        let mut collector = EdgeCollector {
            from: cell.addr(),
            edges: &mut edges,
        };
        // SAFETY: as above; the collector only reads slots.
        unsafe { visit_cell(cell, &mut collector) };
    });

    let snapshot = Snapshot {
        meta: Meta {
            node_count: nodes.len(),
            edge_count: edges.len(),
            heap_bytes,
        },
        nodes,
        edges,
        strings,
    };
    serde_json::to_writer(writer, &snapshot)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
}
