use isolink::{DerefOptions, Isolate, IsolateOptions, Reference, Scheduler, Value};

fn pair(scheduler: &Scheduler) -> (Isolate, Isolate) {
    (
        scheduler.spawn(IsolateOptions {
            name: Some("owner".to_string()),
        }),
        scheduler.spawn(IsolateOptions {
            name: Some("caller".to_string()),
        }),
    )
}

#[test]
fn test_number_reference_typeof_and_copy() {
    let scheduler = Scheduler::new();
    let (a, b) = pair(&scheduler);

    let reference = a
        .with_lock(|scope| Reference::new(scope, &Value::Number(42.0)))
        .unwrap();
    assert_eq!(reference.type_of().unwrap(), "number");

    let copied = b.with_lock(|scope| reference.copy_sync(scope)).unwrap();
    assert_eq!(copied.as_number(), Some(42.0));
}

#[test]
fn test_typeof_matches_engine_classification() {
    let scheduler = Scheduler::new();
    let a = scheduler.spawn(IsolateOptions::default());

    a.with_lock(|scope| {
        let object = scope.alloc_object();
        let function = scope.alloc_function(|_scope, _args| Ok(Value::Undefined));
        let cases = [
            (Value::Null, "null"),
            (Value::Undefined, "undefined"),
            (Value::Number(0.5), "number"),
            (Value::string("s"), "string"),
            (Value::Bool(false), "boolean"),
            (object, "object"),
            (function, "function"),
        ];
        for (value, expected) in cases {
            let reference = Reference::new(scope, &value).unwrap();
            assert_eq!(reference.type_of().unwrap(), expected);
        }
    });
}

#[test]
fn test_release_is_idempotent_and_poisons_operations() {
    let scheduler = Scheduler::new();
    let (a, b) = pair(&scheduler);

    let reference = a
        .with_lock(|scope| Reference::new(scope, &Value::Number(1.0)))
        .unwrap();
    reference.release().unwrap();

    let err = reference.release().unwrap_err();
    assert_eq!(err.message(), "Reference has been released");
    assert_eq!(
        reference.type_of().unwrap_err().message(),
        "Reference has been released"
    );
    let err = b.with_lock(|scope| reference.copy_sync(scope)).unwrap_err();
    assert_eq!(err.message(), "Reference has been released");
}

#[test]
fn test_deref_requires_owner_isolate() {
    let scheduler = Scheduler::new();
    let (a, b) = pair(&scheduler);

    let reference = a
        .with_lock(|scope| {
            let object = scope.alloc_object();
            Reference::new(scope, &object)
        })
        .unwrap();

    let err = b
        .with_lock(|scope| reference.deref(scope, DerefOptions::default()))
        .unwrap_err();
    assert_eq!(err.message(), "Cannot dereference this from current isolate");

    a.with_lock(|scope| {
        let value = reference.deref(scope, DerefOptions::default()).unwrap();
        assert!(matches!(value, Value::Object(_)));
    });
}

#[test]
fn test_deref_with_release_consumes_reference() {
    let scheduler = Scheduler::new();
    let a = scheduler.spawn(IsolateOptions::default());

    let reference = a
        .with_lock(|scope| Reference::new(scope, &Value::Number(5.0)))
        .unwrap();
    let value = a
        .with_lock(|scope| reference.deref(scope, DerefOptions { release: true }))
        .unwrap();
    assert_eq!(value.as_number(), Some(5.0));
    assert_eq!(
        reference.type_of().unwrap_err().message(),
        "Reference has been released"
    );
}

#[test]
fn test_copy_is_deep_and_detached() {
    let scheduler = Scheduler::new();
    let (a, b) = pair(&scheduler);

    let reference = a
        .with_lock(|scope| {
            let inner = scope.alloc_object();
            scope.set_property(&inner, "b", Value::Number(1.0)).unwrap();
            let outer = scope.alloc_object();
            scope.set_property(&outer, "a", inner).unwrap();
            Reference::new(scope, &outer)
        })
        .unwrap();

    b.with_lock(|scope| {
        let copy = reference.copy_sync(scope).unwrap();
        let inner = scope.get_property(&copy, "a").unwrap();
        assert_eq!(
            scope.get_property(&inner, "b").unwrap().as_number(),
            Some(1.0)
        );
        // Mutating the copy must not reach the original.
        scope.set_property(&inner, "b", Value::Number(99.0)).unwrap();
    });

    a.with_lock(|scope| {
        let original = reference.deref(scope, DerefOptions::default()).unwrap();
        let inner = scope.get_property(&original, "a").unwrap();
        assert_eq!(
            scope.get_property(&inner, "b").unwrap().as_number(),
            Some(1.0)
        );
    });
}

#[test]
fn test_copy_async_resolves_off_the_lock() {
    let scheduler = Scheduler::new();
    let (a, b) = pair(&scheduler);

    let reference = a
        .with_lock(|scope| Reference::new(scope, &Value::string("payload")))
        .unwrap();
    let pending = b.with_lock(|scope| reference.copy(scope)).unwrap();
    let value = pending.wait().unwrap();
    assert_eq!(value.as_str(), Some("payload"));
}

#[test]
fn test_get_chain_reaches_nested_value() {
    let scheduler = Scheduler::new();
    let (a, b) = pair(&scheduler);

    let reference = a
        .with_lock(|scope| {
            let inner = scope.alloc_object();
            scope.set_property(&inner, "b", Value::Number(1.0)).unwrap();
            let outer = scope.alloc_object();
            scope.set_property(&outer, "a", inner).unwrap();
            Reference::new(scope, &outer)
        })
        .unwrap();

    let result = b.with_lock(|scope| {
        let a_value = reference.get_sync(scope, &Value::string("a"), None).unwrap();
        let a_ref = Reference::from_value(scope, &a_value).expect("reference expected");
        assert_eq!(a_ref.type_of().unwrap(), "object");

        let b_value = a_ref.get_sync(scope, &Value::string("b"), None).unwrap();
        let b_ref = Reference::from_value(scope, &b_value).expect("reference expected");
        assert_eq!(b_ref.type_of().unwrap(), "number");

        b_ref.copy_sync(scope).unwrap()
    });
    assert_eq!(result.as_number(), Some(1.0));
}

#[test]
fn test_set_then_get_round_trip_with_copy() {
    let scheduler = Scheduler::new();
    let (a, b) = pair(&scheduler);

    let reference = a
        .with_lock(|scope| {
            let object = scope.alloc_object();
            Reference::new(scope, &object)
        })
        .unwrap();

    b.with_lock(|scope| {
        let nested = scope.alloc_object();
        scope.set_property(&nested, "nested", Value::Number(1.0)).unwrap();
        let copy_options = scope.alloc_object();
        scope
            .set_property(&copy_options, "copy", Value::Bool(true))
            .unwrap();

        let accepted = reference
            .set_sync(scope, &Value::string("k"), &nested, Some(&copy_options))
            .unwrap();
        assert!(accepted);

        let got = reference
            .get_sync(scope, &Value::string("k"), Some(&copy_options))
            .unwrap();
        assert_eq!(
            scope.get_property(&got, "nested").unwrap().as_number(),
            Some(1.0)
        );
    });
}

#[test]
fn test_get_returns_reference_that_derefs_in_owner() {
    let scheduler = Scheduler::new();
    let (a, b) = pair(&scheduler);

    let reference = a
        .with_lock(|scope| {
            let object = scope.alloc_object();
            scope.set_property(&object, "k", Value::Number(7.0)).unwrap();
            Reference::new(scope, &object)
        })
        .unwrap();

    let k_ref = b.with_lock(|scope| {
        let value = reference.get_sync(scope, &Value::string("k"), None).unwrap();
        Reference::from_value(scope, &value).expect("reference expected")
    });
    let value = a
        .with_lock(|scope| k_ref.deref(scope, DerefOptions::default()))
        .unwrap();
    assert_eq!(value.as_number(), Some(7.0));
}

#[test]
fn test_invalid_key_is_rejected_in_phase_one() {
    let scheduler = Scheduler::new();
    let (a, b) = pair(&scheduler);

    let reference = a
        .with_lock(|scope| {
            let object = scope.alloc_object();
            Reference::new(scope, &object)
        })
        .unwrap();

    b.with_lock(|scope| {
        let object_key = scope.alloc_object();
        let err = reference
            .get_sync(scope, &object_key, None)
            .unwrap_err();
        assert_eq!(err.message(), "Invalid `key`");

        let err = reference
            .set_sync(scope, &object_key, &Value::Number(1.0), None)
            .unwrap_err();
        assert_eq!(err.message(), "Invalid `key`");
    });
}

#[test]
fn test_set_ignored_applies_eventually() {
    let scheduler = Scheduler::new();
    let (a, b) = pair(&scheduler);

    let reference = a
        .with_lock(|scope| {
            let object = scope.alloc_object();
            Reference::new(scope, &object)
        })
        .unwrap();

    b.with_lock(|scope| {
        reference
            .set_ignored(scope, &Value::string("k"), &Value::Number(3.0), None)
            .unwrap();
        // A later sync operation on the same queue observes the write.
        let got = reference.get_sync(scope, &Value::string("k"), None).unwrap();
        let got_ref = Reference::from_value(scope, &got).expect("reference expected");
        assert_eq!(got_ref.copy_sync(scope).unwrap().as_number(), Some(3.0));
    });
}

#[test]
fn test_deref_into_lands_value_in_owner() {
    let scheduler = Scheduler::new();
    let (a, b) = pair(&scheduler);

    // Target object in A, plus a second reference whose value will be
    // handed over as a dereference.
    let target = a
        .with_lock(|scope| {
            let object = scope.alloc_object();
            Reference::new(scope, &object)
        })
        .unwrap();
    let payload = a
        .with_lock(|scope| {
            let object = scope.alloc_object();
            scope.set_property(&object, "tag", Value::string("home")).unwrap();
            Reference::new(scope, &object)
        })
        .unwrap();

    b.with_lock(|scope| {
        let handed = payload.deref_into(scope, DerefOptions::default()).unwrap();
        let accepted = target
            .set_sync(scope, &Value::string("landed"), &handed, None)
            .unwrap();
        assert!(accepted);
    });

    a.with_lock(|scope| {
        let object = target.deref(scope, DerefOptions::default()).unwrap();
        let landed = scope.get_property(&object, "landed").unwrap();
        assert_eq!(
            scope.get_property(&landed, "tag").unwrap().as_str(),
            Some("home")
        );
    });
}

#[test]
fn test_deref_into_is_single_use() {
    let scheduler = Scheduler::new();
    let (a, b) = pair(&scheduler);

    let target = a
        .with_lock(|scope| {
            let object = scope.alloc_object();
            Reference::new(scope, &object)
        })
        .unwrap();
    let payload = a
        .with_lock(|scope| Reference::new(scope, &Value::Number(1.0)))
        .unwrap();

    b.with_lock(|scope| {
        let handed = payload.deref_into(scope, DerefOptions::default()).unwrap();
        target
            .set_sync(scope, &Value::string("first"), &handed, None)
            .unwrap();
        let err = target
            .set_sync(scope, &Value::string("second"), &handed, None)
            .unwrap_err();
        assert_eq!(
            err.message(),
            "The return value of `derefInto()` should only be used once"
        );
    });
}

#[test]
fn test_deref_into_wrong_isolate_fails_on_arrival() {
    let scheduler = Scheduler::new();
    let (a, b) = pair(&scheduler);
    let c = scheduler.spawn(IsolateOptions::default());

    // Payload lives in C; the dereference is sent into A, which is not
    // its home isolate.
    let target = a
        .with_lock(|scope| {
            let object = scope.alloc_object();
            Reference::new(scope, &object)
        })
        .unwrap();
    let payload = c
        .with_lock(|scope| Reference::new(scope, &Value::Number(9.0)))
        .unwrap();

    b.with_lock(|scope| {
        let handed = payload.deref_into(scope, DerefOptions::default()).unwrap();
        let err = target
            .set_sync(scope, &Value::string("landed"), &handed, None)
            .unwrap_err();
        assert_eq!(err.message(), "Cannot dereference this into target isolate");
    });
}

#[test]
fn test_deref_into_on_released_reference_fails() {
    let scheduler = Scheduler::new();
    let a = scheduler.spawn(IsolateOptions::default());

    let reference = a
        .with_lock(|scope| Reference::new(scope, &Value::Number(1.0)))
        .unwrap();
    reference.release().unwrap();
    let err = a
        .with_lock(|scope| reference.deref_into(scope, DerefOptions::default()))
        .unwrap_err();
    assert_eq!(err.message(), "Reference has been released");
}

#[test]
fn test_operations_against_disposed_owner_fail() {
    let scheduler = Scheduler::new();
    let (a, b) = pair(&scheduler);

    let reference = a
        .with_lock(|scope| Reference::new(scope, &Value::Number(1.0)))
        .unwrap();
    a.dispose();

    let err = b.with_lock(|scope| reference.copy_sync(scope)).unwrap_err();
    assert_eq!(err.message(), "Isolate is disposed");

    // Dropping the reference after disposal must not touch the dead heap.
    drop(reference);
}
