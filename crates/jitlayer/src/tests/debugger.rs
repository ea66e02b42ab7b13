use std::sync::Arc;

use object::{Object, ObjectSection};

use crate::debug::DebugRegistrar;
use crate::engine::JitEngine;
use crate::memory::HeapMemoryManager;
use crate::pipeline::ObjectFileLowering;
use crate::tests::test_helpers::{
    heap_engine, heap_engine_with, remove, ret42_object, strip_symbol_table, test_config,
    ObjectFixture, RET_42,
};
use crate::types::JitConfig;

#[test]
fn test_removing_middle_module_keeps_list_well_formed() {
    let (engine, registrar) = heap_engine();
    let a = engine.add_object_file(ret42_object("a", "fa")).unwrap();
    let b = engine.add_object_file(ret42_object("b", "fb")).unwrap();
    let c = engine.add_object_file(ret42_object("c", "fc")).unwrap();
    assert_eq!(registrar.len(), 3);
    assert!(registrar.is_well_formed());

    let image_of = |handle| {
        engine
            .module_object(handle)
            .unwrap()
            .image()
            .bytes()
            .as_ptr()
            .addr()
    };
    let (a_image, c_image) = (image_of(a), image_of(c));

    remove(&engine, b).unwrap();
    assert!(registrar.is_well_formed());
    let listed: Vec<usize> = registrar.entries().iter().map(|e| e.symfile_addr).collect();
    assert_eq!(listed, vec![c_image, a_image]);

    // Registration after an unlink still produces a consistent list.
    engine.add_object_file(ret42_object("d", "fd")).unwrap();
    assert!(registrar.is_well_formed());
    assert_eq!(registrar.len(), 3);
}

#[test]
fn test_debug_image_carries_load_addresses() {
    let (engine, registrar) = heap_engine();
    let mut fixture = ObjectFixture::x86_64();
    fixture.function("code", RET_42);
    fixture.rodata("constant", &[1; 8]);
    fixture.data("variable", &[2; 8]);
    let handle = engine.add_object_file(fixture.finish("debuggable")).unwrap();
    let object = engine.module_object(handle).unwrap();

    assert!(object.image().is_debug());
    let entry = registrar.entries()[0];
    assert_eq!(entry.symfile_addr, object.image().bytes().as_ptr().addr());
    assert_eq!(entry.symfile_size, object.image().bytes().len() as u64);

    let image = object::File::parse(object.image().bytes()).unwrap();
    assert!(!object.sections().is_empty());
    for loaded in object.sections() {
        let section = image.section_by_name(&loaded.name).unwrap();
        assert_eq!(section.address(), loaded.address, "{}", loaded.name);
    }
}

#[test]
fn test_stripped_object_falls_back_to_original_bytes() {
    let (engine, registrar) = heap_engine();
    let original = ret42_object("stripped", "anonymous");
    let stripped = strip_symbol_table(&original);
    let handle = engine.add_object_file(stripped.clone()).unwrap();
    let object = engine.module_object(handle).unwrap();

    assert!(!object.image().is_debug());
    assert_eq!(object.image().bytes(), stripped.as_slice());
    assert!(object.symbols().is_empty());
    assert!(registrar.is_empty());

    let metrics = engine.metrics();
    assert_eq!(metrics.debug_fallbacks, 1);
    assert_eq!(metrics.debug_registrations, 0);

    // Unloading an unregistered object is fine.
    remove(&engine, handle).unwrap();
    assert!(registrar.is_well_formed());
}

#[test]
fn test_debugger_registration_can_be_disabled() {
    let (engine, registrar) = heap_engine_with(JitConfig {
        register_with_debugger: false,
        ..test_config()
    });
    let handle = engine.add_object_file(ret42_object("quiet", "q")).unwrap();

    assert!(engine.module_object(handle).unwrap().image().is_debug());
    assert!(registrar.is_empty());
    assert_eq!(engine.metrics().debug_registrations, 0);
    remove(&engine, handle).unwrap();
}

#[test]
#[serial_test::serial]
fn test_default_engine_uses_process_wide_list() {
    let global = DebugRegistrar::global();
    let before = global.len();

    let engine = JitEngine::with_memory_manager(
        ObjectFileLowering::new(),
        test_config(),
        Arc::new(HeapMemoryManager::new()),
    );
    let handle = engine
        .add_object_file(ret42_object("global", "global_fn"))
        .unwrap();
    assert_eq!(global.len(), before + 1);
    assert!(global.is_well_formed());

    remove(&engine, handle).unwrap();
    assert_eq!(global.len(), before);

    engine
        .add_object_file(ret42_object("global2", "global_fn2"))
        .unwrap();
    drop(engine);
    assert_eq!(global.len(), before);
    assert!(global.is_well_formed());
}
