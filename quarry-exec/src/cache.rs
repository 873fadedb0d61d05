//! The compilation cache: a trie keyed by join-order permutations.
//!
//! Adaptive join reordering revisits the same orders across queries, and
//! recompiling a join body dominates total time. Keys are permutations of
//! table indices `0..N`, so the trie has depth `N` and lookup is O(N)
//! with no hashing.

use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use quarry_jit::AsmBackend;
use quarry_khir::{Backend, Program};
use quarry_llvm::LlvmBackend;

use crate::config::{BackendKind, ExecConfig};
use crate::error::ExecError;

/// One compiled join order.
#[derive(Default)]
pub struct CacheEntry {
    program: Option<Program>,
    backend: Option<Box<dyn Backend>>,
    compiled: AtomicBool,
    entry_fn: AtomicPtr<u8>,
}

impl CacheEntry {
    pub fn is_compiled(&self) -> bool {
        self.compiled.load(Ordering::Acquire)
    }

    /// The cached program, once compiled.
    pub fn program(&self) -> Option<&Program> {
        self.program.as_ref()
    }

    /// The published entry pointer, once [`CacheEntry::compile`] succeeded.
    pub fn entry_ptr(&self) -> Option<*const u8> {
        if !self.is_compiled() {
            return None;
        }
        Some(self.entry_fn.load(Ordering::Acquire).cast_const())
    }

    /// Address of any other compiled symbol in this entry's program.
    pub fn func(&self, name: &str) -> Option<*const u8> {
        self.backend.as_ref()?.entry(name)
    }

    /// Builds a backend of the configured kind for `program` and publishes
    /// `main_name`'s pointer; the compiled flag flips only after the
    /// pointer is in place.
    pub fn compile(
        &mut self,
        program: Program,
        main_name: &str,
        config: &ExecConfig,
    ) -> Result<(), ExecError> {
        let mut backend: Box<dyn Backend> = match config.backend {
            BackendKind::Asm => Box::new(AsmBackend::new(config.reg_alloc.into())),
            BackendKind::Llvm => Box::new(LlvmBackend::new()),
        };
        backend.translate(&program)?;
        backend.compile()?;
        let entry = backend
            .entry(main_name)
            .ok_or_else(|| ExecError::MissingEntry(main_name.to_owned()))?;

        self.program = Some(program);
        self.backend = Some(backend);
        self.entry_fn.store(entry.cast_mut(), Ordering::Release);
        self.compiled.store(true, Ordering::Release);
        Ok(())
    }
}

struct TrieNode {
    children: Vec<Option<Box<TrieNode>>>,
    entry: Option<Box<CacheEntry>>,
}

impl TrieNode {
    fn new(num_tables: usize) -> Self {
        let mut children = Vec::with_capacity(num_tables);
        children.resize_with(num_tables, || None);
        Self { children, entry: None }
    }
}

/// Permutation-keyed cache of compiled programs.
pub struct CompilationCache {
    root: TrieNode,
    num_tables: usize,
}

impl CompilationCache {
    pub fn new(num_tables: usize) -> Self {
        Self { root: TrieNode::new(num_tables), num_tables }
    }

    pub fn num_tables(&self) -> usize {
        self.num_tables
    }

    /// Descends along `order`, creating nodes as needed; returns the
    /// (possibly empty) entry at the leaf.
    pub fn get_or_insert(&mut self, order: &[usize]) -> &mut CacheEntry {
        debug_assert_eq!(order.len(), self.num_tables);
        let num_tables = self.num_tables;
        let mut current = &mut self.root;
        for &table in order {
            current = current.children[table]
                .get_or_insert_with(|| Box::new(TrieNode::new(num_tables)));
        }
        current.entry.get_or_insert_with(Box::default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_khir::ProgramBuilder;

    #[test]
    fn same_order_same_entry_distinct_orders_distinct_entries() {
        let mut cache = CompilationCache::new(3);
        let a = cache.get_or_insert(&[0, 1, 2]) as *const CacheEntry;
        let b = cache.get_or_insert(&[0, 1, 2]) as *const CacheEntry;
        let c = cache.get_or_insert(&[2, 1, 0]) as *const CacheEntry;
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn compile_publishes_the_entry_pointer() {
        let mut b = ProgramBuilder::new();
        let i64t = b.i64_type();
        b.create_public_function(i64t, &[], "join_body").unwrap();
        let forty_two = b.const_i64(42);
        b.ret_value(forty_two).unwrap();
        let program = b.finish();

        let mut cache = CompilationCache::new(2);
        let entry = cache.get_or_insert(&[1, 0]);
        assert!(!entry.is_compiled());
        assert_eq!(entry.entry_ptr(), None);

        entry
            .compile(program, "join_body", &ExecConfig::default())
            .unwrap();
        assert!(entry.is_compiled());
        let ptr = entry.entry_ptr().unwrap();
        let f: extern "C" fn() -> i64 = unsafe { std::mem::transmute(ptr) };
        assert_eq!(f(), 42);
        assert_eq!(entry.func("join_body"), Some(ptr));
    }
}
