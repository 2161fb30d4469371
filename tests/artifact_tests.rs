//! Persistent artifact store tests

mod common;

use common::*;
use pretty_assertions::assert_eq;
use std::collections::BTreeSet;
use std::fs;
use tempfile::TempDir;
use tierjit::artifact::{
    hash_ast, ArtifactStore, Ast, CleanupMode, Hast, HastRegistry, LinkOutcome, RegisterOutcome,
    StoreRequest,
};
use tierjit::compiler::CompileOutcome;
use tierjit::dispatch::{FunctionId, LinkRequest, NativeCode};
use tierjit::error::SerializerError;
use tierjit::ir::TypeSet;
use tierjit::{ClosureDef, ContextFingerprint, JitConfig};

fn native() -> NativeCode {
    NativeCode {
        symbol: "unit".to_string(),
        code: vec![0x90, 0xc3],
        pool: vec![7],
    }
}

fn request<'a>(code: &'a NativeCode, hast: Hast, requests: &[Hast]) -> StoreRequest<'a> {
    StoreRequest {
        hast,
        digest: 0x5eed,
        name: "unit",
        offset: 0,
        context: simple_int0(),
        mask: 0,
        code,
        requests: requests.iter().copied().collect(),
        tf_slots: vec![0],
        tv_data: vec![2],
        fb_slots: Vec::new(),
        fb_data: Vec::new(),
    }
}

fn config(dir: &TempDir) -> JitConfig {
    JitConfig::new().with_eviction_seed(5).with_serializer(dir.path())
}

/// `function(x) x + n`; units differing only in `n` share a hast
fn literal_unit(n: i64) -> Ast {
    Ast::call(
        Ast::sym("function"),
        vec![
            Ast::List(vec![Ast::sym("x")]),
            Ast::call(Ast::sym("+"), vec![Ast::sym("x"), Ast::Int(n)]),
        ],
    )
}

mod round_trip {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_relinked_dependencies_match_stored() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let code = native();
        let deps = [Hast(0xa), Hast(0xb)];
        assert_eq!(store.store(request(&code, Hast(1), &deps)).unwrap(), 0);
        assert_eq!(store.store(request(&code, Hast(1), &deps)).unwrap(), 1);

        let meta = store.lookup(Hast(1)).unwrap();
        assert_eq!(meta.context_count(), 1);
        assert_eq!(meta.get(0, simple_int0().bits()).unwrap().version, 1);

        let mut registry = HastRegistry::new();
        let report = store.relink(&mut registry).unwrap();
        assert_eq!((report.entries, report.contexts, report.corrupt), (1, 1, 0));
        assert_eq!(registry.dependencies(Hast(1)), Some(&BTreeSet::from(deps)));
        assert_eq!(registry.available_for(Hast(1)), vec![(0, simple_int0())]);
    }

    #[test]
    fn test_offsets_and_contexts_accumulate() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let code = native();
        store.store(request(&code, Hast(3), &[])).unwrap();
        let mut inner = request(&code, Hast(3), &[Hast(9)]);
        inner.offset = 12;
        inner.context = ContextFingerprint::new().set_eager(1);
        store.store(inner).unwrap();

        let meta = store.lookup(Hast(3)).unwrap();
        assert_eq!(meta.context_count(), 2);
        assert_eq!(meta.offsets.len(), 2);
        assert_eq!(meta.dependencies(), BTreeSet::from([Hast(9)]));
    }

    #[test]
    fn test_restart_links_persisted_variant() {
        let dir = TempDir::new().unwrap();
        let ast = unit_ast("f");
        let hast = hash_ast(&ast);
        let dep = hash_ast(&unit_ast("helper"));

        {
            let (mut jit, script) = jit_with(config(&dir));
            script.borrow_mut().requests.insert(FunctionId(0), BTreeSet::from([dep]));
            let f = jit.compile_closure(ClosureDef::new("f", 1, 40).with_ast(ast.clone()));
            assert_eq!(f.function, FunctionId(0));
            jit.optimize(f.function, simple_int0(), |_| {}).unwrap();
            assert_eq!(jit.serializer_report().stored, 1);
        }

        let (mut jit, script) = jit_with(config(&dir));
        let report = jit.relink_artifacts().unwrap();
        assert_eq!(report.entries, 1);
        assert_eq!(jit.registry().dependencies(hast), Some(&BTreeSet::from([dep])));

        let f = jit.compile_closure(ClosureDef::new("f", 1, 40).with_ast(ast));
        let linked = jit.dispatch(f.function, simple_int0()).unwrap();
        assert_ne!(linked, f.baseline);
        assert_eq!(
            script.borrow().loaded,
            vec![ArtifactStore::blob_stem(hast, 0, simple_int0())]
        );

        let again = jit.optimize(f.function, simple_int0(), |_| {}).unwrap();
        assert_eq!(again, CompileOutcome::AlreadyCompiled(linked));
        assert!(script.borrow().optimized.is_empty());
    }

    #[test]
    fn test_relink_after_closure_creation() {
        let dir = TempDir::new().unwrap();
        let ast = unit_ast("f");
        {
            let (mut jit, _) = jit_with(config(&dir));
            let f = jit.compile_closure(ClosureDef::new("f", 1, 40).with_ast(ast.clone()));
            jit.optimize(f.function, simple_int0(), |_| {}).unwrap();
        }

        let (mut jit, _) = jit_with(config(&dir));
        let f = jit.compile_closure(ClosureDef::new("f", 1, 40).with_ast(ast));
        assert_eq!(jit.table(f.function).unwrap().size(), 1);
        jit.relink_artifacts().unwrap();
        assert_eq!(jit.table(f.function).unwrap().size(), 2);
    }

    #[test]
    fn test_new_compilation_marks_persisted_code_stale() {
        let dir = TempDir::new().unwrap();
        let ast = unit_ast("f");
        let hast = hash_ast(&ast);
        {
            let (mut jit, _) = jit_with(config(&dir));
            let f = jit.compile_closure(ClosureDef::new("f", 1, 40).with_ast(ast.clone()));
            jit.optimize(f.function, simple_int0(), |_| {}).unwrap();
        }

        let (mut jit, _) = jit_with(config(&dir));
        jit.relink_artifacts().unwrap();
        let f = jit.compile_closure(ClosureDef::new("f", 1, 40).with_ast(ast));
        assert!(!jit.registry().is_stale(hast));
        jit.optimize(f.function, ContextFingerprint::new().set_eager(0), |_| {})
            .unwrap();
        assert!(jit.registry().is_stale(hast));
    }

    #[test]
    fn test_speculative_code_relinked_behind_its_feedback() {
        let dir = TempDir::new().unwrap();
        let ast = unit_ast("f");
        {
            let (mut jit, script) = jit_with(config(&dir));
            let f = jit.compile_closure(ClosureDef::new("f", 1, 40).with_ast(ast.clone()));
            let slot = jit.profiles_mut().add_type_slot(f.function);
            jit.profiles_mut().record_type(slot, TypeSet::INTEGER);
            script.borrow_mut().speculate.insert(f.function, vec![slot]);
            jit.optimize(f.function, simple_int0(), |_| {}).unwrap();
            assert_eq!(jit.serializer_report().stored, 1);
        }

        let mut cfg = config(&dir);
        cfg.fast_case_dispatch = false;
        let (mut jit, script) = jit_with(cfg);
        jit.relink_artifacts().unwrap();
        let f = jit.compile_closure(ClosureDef::new("f", 1, 40).with_ast(ast));
        assert_eq!(script.borrow().loaded.len(), 1);
        let slot = jit.profiles_mut().add_type_slot(f.function);

        // nothing observed in this run yet
        assert_eq!(jit.dispatch(f.function, simple_int0()).unwrap(), f.baseline);
        jit.profiles_mut().record_type(slot, TypeSet::INTEGER);
        let linked = jit.dispatch(f.function, simple_int0()).unwrap();
        assert_ne!(linked, f.baseline);
        assert!(jit.variant(linked).unwrap().speculation.is_some());
        jit.profiles_mut().record_type(slot, TypeSet::REAL);
        assert_eq!(jit.dispatch(f.function, simple_int0()).unwrap(), f.baseline);
    }

    #[test]
    fn test_same_hast_other_tree_is_not_linked() {
        let dir = TempDir::new().unwrap();
        let one = literal_unit(1);
        let two = literal_unit(2);
        let hast = hash_ast(&one);
        assert_eq!(hast, hash_ast(&two));
        {
            let (mut jit, _) = jit_with(config(&dir));
            let f = jit.compile_closure(ClosureDef::new("f", 1, 40).with_ast(one));
            jit.optimize(f.function, simple_int0(), |_| {}).unwrap();
            assert_eq!(jit.serializer_report().stored, 1);
        }

        let (mut jit, script) = jit_with(config(&dir));
        jit.relink_artifacts().unwrap();
        let g = jit.compile_closure(ClosureDef::new("g", 1, 40).with_ast(two));
        assert_eq!(jit.dispatch(g.function, simple_int0()).unwrap(), g.baseline);
        assert!(script.borrow().loaded.is_empty());
        assert!(jit.registry().is_blacklisted(hast));
        assert!(ArtifactStore::new(dir.path()).lookup(hast).is_none());
    }

    #[test]
    fn test_second_relink_loads_nothing_new() {
        let dir = TempDir::new().unwrap();
        let ast = unit_ast("f");
        {
            let (mut jit, _) = jit_with(config(&dir));
            let f = jit.compile_closure(ClosureDef::new("f", 1, 40).with_ast(ast.clone()));
            jit.optimize(f.function, simple_int0(), |_| {}).unwrap();
        }

        let (mut jit, script) = jit_with(config(&dir));
        jit.relink_artifacts().unwrap();
        let f = jit.compile_closure(ClosureDef::new("f", 1, 40).with_ast(ast));
        assert_eq!(jit.table(f.function).unwrap().size(), 2);

        let report = jit.relink_artifacts().unwrap();
        assert_eq!(report.entries, 1);
        assert_eq!(jit.table(f.function).unwrap().size(), 2);
        assert_eq!(script.borrow().loaded.len(), 1);
    }

    #[test]
    fn test_failed_metadata_rewrite_keeps_entry() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let code = native();
        store.store(request(&code, Hast(1), &[])).unwrap();
        fs::create_dir(dir.path().join(format!("m_{}.meta.tmp", Hast(1)))).unwrap();

        let mut second = request(&code, Hast(1), &[Hast(2)]);
        second.context = ContextFingerprint::new().set_eager(1);
        let stem = ArtifactStore::blob_stem(Hast(1), 0, second.context);
        assert!(matches!(store.store(second), Err(SerializerError::Write { .. })));

        let meta = store.lookup(Hast(1)).unwrap();
        assert_eq!(meta.context_count(), 1);
        assert!(meta.dependencies().is_empty());
        assert!(store.read_blobs(&ArtifactStore::blob_stem(Hast(1), 0, simple_int0())).is_ok());
        assert!(!dir.path().join(format!("{}.bc.tmp", stem)).exists());
        assert!(store.read_blobs(&stem).is_err());
    }

    #[test]
    fn test_corrupt_entry_skipped_on_relink() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let code = native();
        store.store(request(&code, Hast(5), &[])).unwrap();
        fs::write(store.meta_path(Hast(6)), b"not metadata").unwrap();

        let mut registry = HastRegistry::new();
        let report = store.relink(&mut registry).unwrap();
        assert_eq!((report.entries, report.corrupt), (1, 1));
        assert!(!store.meta_path(Hast(6)).exists());
    }
}

mod cleanup {
    use super::*;
    use pretty_assertions::assert_eq;

    /// E1 blacklisted, E2 requests E1, E3 unrelated, E4 requests E2
    fn populate(store: &ArtifactStore) {
        let code = native();
        store.store(request(&code, Hast(1), &[])).unwrap();
        store.store(request(&code, Hast(2), &[Hast(1)])).unwrap();
        store.store(request(&code, Hast(3), &[Hast(0x77)])).unwrap();
        store.store(request(&code, Hast(4), &[Hast(2)])).unwrap();
    }

    fn present(store: &ArtifactStore) -> Vec<Hast> {
        let (entries, _) = store.entries().unwrap();
        entries.into_iter().map(|m| m.hast).collect()
    }

    #[test]
    fn test_direct_cleanup_removes_blacklisted_and_dependents() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        populate(&store);

        let report = store
            .cleanup(&BTreeSet::from([Hast(1)]), CleanupMode::Direct)
            .unwrap();
        assert_eq!(report.removed, vec![Hast(1), Hast(2)]);
        assert_eq!(report.kept, 2);
        assert_eq!(report.files, 6);
        assert_eq!(present(&store), vec![Hast(3), Hast(4)]);
        let stem = ArtifactStore::blob_stem(Hast(2), 0, simple_int0());
        assert!(store.read_blobs(&stem).is_err());
    }

    #[test]
    fn test_transitive_cleanup_follows_chains() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        populate(&store);

        let report = store
            .cleanup(&BTreeSet::from([Hast(1)]), CleanupMode::Transitive)
            .unwrap();
        assert_eq!(report.removed, vec![Hast(1), Hast(2), Hast(4)]);
        assert_eq!(present(&store), vec![Hast(3)]);
    }

    #[test]
    fn test_collision_blacklists_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        // byte sums match, so the two units share a hast
        let first = unit_ast("ab");
        let second = unit_ast("ba");
        let hast = hash_ast(&first);
        assert_eq!(hast, hash_ast(&second));
        {
            let (mut jit, _) = jit_with(config(&dir));
            let f = jit.compile_closure(ClosureDef::new("ab", 1, 40).with_ast(first.clone()));
            jit.optimize(f.function, simple_int0(), |_| {}).unwrap();
        }

        let (mut jit, _) = jit_with(config(&dir));
        jit.compile_closure(ClosureDef::new("ab", 1, 40).with_ast(first));
        let g = jit.compile_closure(ClosureDef::new("ba", 1, 40).with_ast(second));
        assert!(jit.registry().is_blacklisted(hast));
        assert!(jit.table(g.function).unwrap().hast().is_none());

        let report = jit.cleanup_artifacts(CleanupMode::Direct).unwrap();
        assert_eq!(report.removed, vec![hast]);
        assert!(ArtifactStore::new(dir.path()).lookup(hast).is_none());
    }
}

mod registry {
    use super::*;
    use pretty_assertions::assert_eq;

    fn link(hast: Hast) -> LinkRequest {
        LinkRequest {
            hast,
            offset: 0,
            context: simple_int0(),
            num_arguments: 1,
        }
    }

    #[test]
    fn test_link_refused_for_tainted_dependencies() {
        let mut registry = HastRegistry::new();
        registry.record_available(Hast(1), 0, simple_int0());
        registry.set_dependencies(Hast(1), BTreeSet::from([Hast(2)]));
        registry.blacklist_hast(Hast(2));
        assert_eq!(registry.try_link(&link(Hast(1))), LinkOutcome::Blacklisted);
    }

    #[test]
    fn test_link_once() {
        let mut registry = HastRegistry::new();
        assert_eq!(registry.try_link(&link(Hast(1))), LinkOutcome::NotAvailable);
        registry.record_available(Hast(1), 0, simple_int0());
        assert_eq!(registry.try_link(&link(Hast(1))), LinkOutcome::Linked);
        assert_eq!(registry.try_link(&link(Hast(1))), LinkOutcome::AlreadyLinked);
        registry.mark_stale(Hast(1));
        assert_eq!(registry.try_link(&link(Hast(1))), LinkOutcome::Stale);
    }

    #[test]
    fn test_same_tree_registers_once() {
        let mut registry = HastRegistry::new();
        let ast = unit_ast("f");
        let hast = hash_ast(&ast);
        assert_eq!(
            registry.register(hast, ast.digest(), FunctionId(0), "f"),
            RegisterOutcome::Registered
        );
        assert_eq!(
            registry.register(hast, ast.digest(), FunctionId(3), "f"),
            RegisterOutcome::AlreadyRegistered(FunctionId(0))
        );
        assert_eq!(registry.function_of(hast), Some(FunctionId(0)));
        assert_eq!(registry.name_of(hast), Some("f"));
    }
}
