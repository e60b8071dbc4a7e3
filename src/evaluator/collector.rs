//! Reclaiming frames that only reference cycles keep alive.
//!
//! A closure holds the frame it was created in, and a frame holds the closures
//! bound in it, so a call frame with an internal `define` still owns itself after
//! the call returns. Every frame is registered here when it is created; once
//! enough frames have been created since the last pass, a pass runs.
//!
//! Roots are not tracked explicitly: any `Rc` held by Rust code (the evaluator's
//! own locals, a session, a caller holding a result) may be one. A pass therefore
//! works by trial deletion. It gathers the frames, closures and pairs reachable
//! from the registered frames and counts the strong references each receives
//! from the others. A node with more strong references than that is held from
//! outside and is a root. Everything reachable from a root is live; every other
//! frame has its bindings cleared and every other pair is emptied, which breaks
//! the cycles and lets reference counting free them.

use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::rc::{Rc, Weak};

use tracing::debug;

use super::{Enclosing, Frame};
use crate::ast::{Closure, Pair, Value};

/// Frames created between passes, at minimum
const INITIAL_THRESHOLD: usize = 4096;

struct Registry {
    frames: Vec<Weak<Frame>>,
    created_since_pass: usize,
    threshold: usize,
}

thread_local! {
    static REGISTRY: RefCell<Registry> = const {
        RefCell::new(Registry {
            frames: Vec::new(),
            created_since_pass: 0,
            threshold: INITIAL_THRESHOLD,
        })
    };
}

/// Track a newly created frame.
pub(super) fn register(frame: &Rc<Frame>) {
    let _ = REGISTRY.try_with(|registry| {
        if let Ok(mut registry) = registry.try_borrow_mut() {
            registry.frames.push(Rc::downgrade(frame));
            registry.created_since_pass += 1;
        }
    });
}

/// Run a pass if enough frames were created since the last one.
pub(super) fn maybe_collect() {
    let due = REGISTRY
        .try_with(|registry| {
            registry
                .try_borrow()
                .is_ok_and(|r| r.created_since_pass >= r.threshold)
        })
        .unwrap_or(false);
    if due {
        collect_cycles();
    }
}

enum Node {
    Frame(Rc<Frame>),
    Closure(Rc<Closure>),
    Pair(Rc<Pair>),
}

impl Node {
    fn of(value: &Value) -> Option<Node> {
        match value {
            Value::Pair(pair) => Some(Node::Pair(Rc::clone(pair))),
            Value::Function(closure) => Some(Node::Closure(Rc::clone(closure))),
            _ => None,
        }
    }

    fn key(&self) -> *const () {
        match self {
            Node::Frame(rc) => Rc::as_ptr(rc).cast(),
            Node::Closure(rc) => Rc::as_ptr(rc).cast(),
            Node::Pair(rc) => Rc::as_ptr(rc).cast(),
        }
    }

    fn strong_count(&self) -> usize {
        match self {
            Node::Frame(rc) => Rc::strong_count(rc),
            Node::Closure(rc) => Rc::strong_count(rc),
            Node::Pair(rc) => Rc::strong_count(rc),
        }
    }

    /// Nodes this one holds a strong reference to, one entry per reference.
    /// `None` when its contents are borrowed for update and cannot be read.
    ///
    /// A closure's body is left out: references from it count as external,
    /// which can only keep more alive.
    fn children(&self) -> Option<Vec<Node>> {
        match self {
            Node::Frame(frame) => {
                let bindings = frame.bindings.try_borrow().ok()?;
                let mut children: Vec<Node> = bindings.values().filter_map(Node::of).collect();
                if let Enclosing::Frame(parent) = &frame.parent {
                    children.push(Node::Frame(Rc::clone(parent)));
                }
                Some(children)
            }
            Node::Closure(closure) => Some(vec![Node::Frame(Rc::clone(&closure.frame))]),
            Node::Pair(pair) => {
                let (car, cdr) = pair.try_contents()?;
                Some(Node::of(&car).into_iter().chain(Node::of(&cdr)).collect())
            }
        }
    }
}

struct Slot {
    node: Node,
    /// Strong references held by other gathered nodes
    internal: usize,
    /// Contents could not be read, so the node is treated as a root
    pinned: bool,
    edges: Vec<usize>,
    live: bool,
}

/// Reclaim every registered frame that is kept alive only by reference cycles.
///
/// Runs automatically as frames are created; calling it directly is useful at
/// the end of a session or in tests. Returns the number of frames cleared.
pub fn collect_cycles() -> usize {
    let roots: Vec<Rc<Frame>> = REGISTRY
        .try_with(|registry| {
            registry.try_borrow_mut().map_or_else(
                |_| Vec::new(),
                |mut registry| {
                    registry.frames.retain(|frame| frame.strong_count() > 0);
                    registry.frames.iter().filter_map(Weak::upgrade).collect()
                },
            )
        })
        .unwrap_or_default();

    let mut slots: Vec<Slot> = Vec::with_capacity(roots.len());
    let mut index: HashMap<*const (), usize> = HashMap::new();
    let mut intern = |node: Node, slots: &mut Vec<Slot>| -> usize {
        match index.entry(node.key()) {
            Entry::Occupied(entry) => *entry.get(),
            Entry::Vacant(entry) => {
                slots.push(Slot {
                    node,
                    internal: 0,
                    pinned: false,
                    edges: Vec::new(),
                    live: false,
                });
                *entry.insert(slots.len() - 1)
            }
        }
    };

    for frame in roots {
        intern(Node::Frame(frame), &mut slots);
    }

    // Gather: discovered nodes are appended and visited in turn.
    let mut next = 0;
    while next < slots.len() {
        match slots[next].node.children() {
            Some(children) => {
                for child in children {
                    let target = intern(child, &mut slots);
                    slots[target].internal += 1;
                    slots[next].edges.push(target);
                }
            }
            None => slots[next].pinned = true,
        }
        next += 1;
    }

    // Each slot holds one reference of its own.
    let mut worklist: Vec<usize> = slots
        .iter()
        .enumerate()
        .filter(|(_, slot)| slot.pinned || slot.node.strong_count() > slot.internal + 1)
        .map(|(ix, _)| ix)
        .collect();
    for &ix in &worklist {
        slots[ix].live = true;
    }
    while let Some(ix) = worklist.pop() {
        for edge in std::mem::take(&mut slots[ix].edges) {
            if !slots[edge].live {
                slots[edge].live = true;
                worklist.push(edge);
            }
        }
    }

    let mut released: Vec<Value> = Vec::new();
    let mut cleared = 0;
    for slot in slots.iter().filter(|slot| !slot.live) {
        match &slot.node {
            Node::Frame(frame) => {
                if let Ok(mut bindings) = frame.bindings.try_borrow_mut() {
                    released.extend(std::mem::take(&mut *bindings).into_values());
                    cleared += 1;
                }
            }
            Node::Pair(pair) => {
                if let Some((car, cdr)) = pair.take_contents() {
                    released.push(car);
                    released.push(cdr);
                }
            }
            Node::Closure(_) => {}
        }
    }

    let visited = slots.len();
    drop(slots);
    drop(released);

    let live_frames = REGISTRY
        .try_with(|registry| {
            registry.try_borrow_mut().map_or(0, |mut registry| {
                registry.frames.retain(|frame| frame.strong_count() > 0);
                registry.created_since_pass = 0;
                registry.threshold = visited.max(INITIAL_THRESHOLD);
                registry.frames.len()
            })
        })
        .unwrap_or(0);
    debug!(cleared, visited, live_frames, "collected frame cycles");
    cleared
}
