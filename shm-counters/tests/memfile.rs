#![cfg(target_os = "linux")]
use memfile::CreateOptions;
use shm_counters::{Config, CounterStore, CounterView, Error, FormatError, Statics};

#[test]
fn store_in_memory_file() {
    let file = CreateOptions::new()
        .create(env!("CARGO_PKG_NAME"))
        .expect("to create a memory file");
    let reader = file.try_clone().unwrap();

    let mut statics = Statics::new();
    statics.insert("backing".into(), "memfd".into());

    let store = CounterStore::create_in(&file, &statics, 8, &Config::default()).unwrap();
    assert_eq!(store.path(), None);
    let counter = store.add_counter("in memory", 12).unwrap();

    let view = CounterView::open_in(&reader).unwrap();
    assert_eq!(view.static_value("backing").as_deref(), Some("memfd"));
    assert_eq!(view.counter_label(counter.id()).unwrap(), "in memory");

    counter.increment(30);
    assert_eq!(view.counter_value(counter.id()).unwrap(), 42);
}

#[test]
fn previous_contents_are_discarded() {
    let file = CreateOptions::new()
        .create(env!("CARGO_PKG_NAME"))
        .expect("to create a memory file");
    let reader = file.try_clone().unwrap();
    let config = Config::default();

    let old = CounterStore::create_in(&file, &Statics::new(), 4, &config).unwrap();
    let stale = old.add_counter("stale", 1).unwrap().id();
    drop(old);

    let store = CounterStore::create_in(&file, &Statics::new(), 4, &config).unwrap();
    let view = CounterView::open_in(&reader).unwrap();

    let mut records = vec![];
    view.counters(&mut records);
    assert!(records.is_empty(), "{records:?}");

    let fresh = store.add_counter("fresh", 2).unwrap();
    assert_eq!(fresh.id(), stale, "ids start over with a new store");
    assert_eq!(view.counter_value(fresh.id()).unwrap(), 2);
}

#[test]
fn empty_memory_file() {
    let file = CreateOptions::new()
        .create(env!("CARGO_PKG_NAME"))
        .expect("to create a memory file");
    file.set_len(0x1000).unwrap();

    assert!(matches!(
        CounterView::open_in(&file),
        Err(Error::Format(FormatError::NotInitialized))
    ));
}
