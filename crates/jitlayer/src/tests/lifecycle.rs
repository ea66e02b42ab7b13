use std::sync::{Arc, Mutex};

use crate::error::JitError;
use crate::listener::JitEventListener;
use crate::store::CodeObject;
use crate::tests::test_helpers::{
    caller_object, heap_engine, read_u64, remove, ret42_object, ObjectFixture,
};
use crate::types::{CodeObjectId, ModuleHandle};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Emitted(CodeObjectId, String),
    Freed(CodeObjectId, String),
}

#[derive(Default)]
struct RecordingListener {
    events: Mutex<Vec<Event>>,
}

impl RecordingListener {
    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

impl JitEventListener for RecordingListener {
    fn object_emitted(&self, object: &CodeObject) {
        self.events
            .lock()
            .unwrap()
            .push(Event::Emitted(object.id(), object.name().to_string()));
    }

    fn object_freed(&self, object: &CodeObject) {
        self.events
            .lock()
            .unwrap()
            .push(Event::Freed(object.id(), object.name().to_string()));
    }
}

#[test]
fn test_handles_are_unique_and_removal_is_single_shot() {
    let (engine, _) = heap_engine();
    let a = engine.add_object_file(ret42_object("a", "fa")).unwrap();
    let b = engine.add_object_file(ret42_object("b", "fb")).unwrap();
    assert_ne!(a, b);
    assert_eq!(engine.module_count(), 2);

    remove(&engine, a).unwrap();
    assert_eq!(engine.module_count(), 1);
    assert!(engine.module_object(a).is_none());

    let err = remove(&engine, a).unwrap_err();
    assert!(matches!(err, JitError::UnknownHandle(h) if h == a), "{err}");
    assert!(!err.is_fatal());

    // The other module is untouched.
    assert!(engine.get_function_address("fb").is_some());
}

#[test]
fn test_unknown_handle_is_rejected() {
    let (engine, _) = heap_engine();
    let err = remove(&engine, ModuleHandle(999)).unwrap_err();
    assert!(matches!(err, JitError::UnknownHandle(_)));
    assert_eq!(engine.metrics().modules_removed, 0);
}

#[test]
fn test_failed_link_publishes_nothing() {
    let (engine, registrar) = heap_engine();
    let mut fixture = ObjectFixture::x86_64();
    fixture.function("would_be_visible", &[0xc3]);
    let data = fixture.data("slot", &[0; 8]);
    let missing = fixture.undefined("definitely_not_defined_anywhere");
    fixture.relocate(data, 0, missing, object::elf::R_X86_64_64, 0);

    let err = engine
        .add_object_file(fixture.finish("broken"))
        .unwrap_err();
    match &err {
        JitError::UnresolvedSymbol { name, module } => {
            assert!(name.contains("definitely_not_defined_anywhere"));
            assert_eq!(module, "broken");
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(engine.module_count(), 0);
    assert!(engine.get_function_address("would_be_visible").is_none());
    assert!(registrar.is_empty());
    let metrics = engine.metrics();
    assert_eq!(metrics.link_failures, 1);
    assert_eq!(metrics.modules_added, 0);
}

#[test]
fn test_weak_undefined_reference_binds_to_null() {
    let (engine, _) = heap_engine();
    let mut fixture = ObjectFixture::x86_64();
    let data = fixture.data("optional_hook", &[0xff; 8]);
    let hook = fixture.weak_undefined("optional_hook_impl");
    fixture.relocate(data, 0, hook, object::elf::R_X86_64_64, 0);
    engine.add_object_file(fixture.finish("weak")).unwrap();

    let slot = engine.get_global_value_address("optional_hook").unwrap();
    assert_eq!(read_u64(slot), 0);
}

#[test]
fn test_listeners_see_emission_and_release() {
    let (engine, _) = heap_engine();
    let listener = Arc::new(RecordingListener::default());
    engine.register_event_listener(listener.clone());

    let handle = engine.add_object_file(ret42_object("watched", "w")).unwrap();
    let id = engine.module_object(handle).unwrap().id();
    assert_eq!(listener.events(), vec![Event::Emitted(id, "watched".into())]);

    remove(&engine, handle).unwrap();
    assert_eq!(
        listener.events(),
        vec![
            Event::Emitted(id, "watched".into()),
            Event::Freed(id, "watched".into()),
        ]
    );
}

#[test]
fn test_listener_not_notified_for_failed_link() {
    let (engine, _) = heap_engine();
    let listener = Arc::new(RecordingListener::default());
    engine.register_event_listener(listener.clone());

    let _ = engine.add_object_file(caller_object("broken", "caller", "no_such_callee_xyz"));
    assert!(listener.events().is_empty());
}

#[test]
fn test_lookup_address_maps_back_to_module() {
    let (engine, _) = heap_engine();
    let handle = engine.add_object_file(ret42_object("located", "loc")).unwrap();
    let object = engine.module_object(handle).unwrap();
    let address = engine.get_function_address("loc").unwrap();

    let (found, offset) = engine.lookup_address(address + 1).unwrap();
    assert_eq!(found.id(), object.id());
    assert_eq!(found.base_address() + offset, address + 1);
    drop(found);
    drop(object);

    remove(&engine, handle).unwrap();
    assert!(engine.lookup_address(address).is_none());
}

#[test]
fn test_removed_object_stays_alive_while_shared() {
    let (engine, _) = heap_engine();
    let handle = engine.add_object_file(ret42_object("shared", "s")).unwrap();
    let object = engine.module_object(handle).unwrap();
    let address = engine.get_function_address("s").unwrap();

    remove(&engine, handle).unwrap();
    // The caller's clone keeps the memory mapped.
    assert!(object.contains(address));
    assert_eq!(object.name(), "shared");
}

#[test]
fn test_metrics_track_lifecycle() {
    let (engine, registrar) = heap_engine();
    let a = engine.add_object_file(ret42_object("a", "one")).unwrap();
    let _b = engine.add_object_file(ret42_object("b", "two")).unwrap();
    remove(&engine, a).unwrap();

    let metrics = engine.metrics();
    assert_eq!(metrics.modules_added, 2);
    assert_eq!(metrics.modules_removed, 1);
    assert_eq!(metrics.debug_registrations, 2);
    assert_eq!(metrics.link_failures, 0);
    assert_eq!(registrar.len(), 1);
}

#[test]
fn test_dropping_engine_unregisters_from_debugger() {
    let (engine, registrar) = heap_engine();
    engine.add_object_file(ret42_object("a", "x")).unwrap();
    engine.add_object_file(ret42_object("b", "y")).unwrap();
    assert_eq!(registrar.len(), 2);

    drop(engine);
    assert!(registrar.is_empty());
    assert!(registrar.is_well_formed());
}
