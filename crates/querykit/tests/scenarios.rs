use std::sync::Arc;

use querykit::{
    Expr, Predicate, QuerySource, Record, RecordingSource, TypeRef, Value, VecSource, are_equal,
    as_expandable, compile, expand,
};

fn person_ty() -> TypeRef {
    TypeRef::named("Person")
}

fn person(name: &str, age: i64) -> Value {
    Value::Record(
        Record::new(person_ty())
            .with_field("name", Value::from(name))
            .with_field("age", Value::Int64(age)),
    )
}

fn name_is(expected: &str) -> Predicate {
    let x = Expr::parameter("x", person_ty());
    let body = Expr::eq(
        Expr::field(x.expr(), "name", TypeRef::utf8()),
        Expr::constant(Value::from(expected)),
    );
    Predicate::wrap(Expr::lambda(vec![x], body)).expect("valid predicate lambda")
}

fn age_over(limit: i64) -> Predicate {
    let x = Expr::parameter("x", person_ty());
    let body = Expr::gt(
        Expr::field(x.expr(), "age", TypeRef::int64()),
        Expr::constant(Value::Int64(limit)),
    );
    Predicate::wrap(Expr::lambda(vec![x], body)).expect("valid predicate lambda")
}

fn age_under(limit: i64) -> Predicate {
    let x = Expr::parameter("x", person_ty());
    let body = Expr::lt(
        Expr::field(x.expr(), "age", TypeRef::int64()),
        Expr::constant(Value::Int64(limit)),
    );
    Predicate::wrap(Expr::lambda(vec![x], body)).expect("valid predicate lambda")
}

#[test]
fn composed_filter_builds_and_evaluates() {
    // name == "A" && (age > 18 || age < 5)
    let filter = name_is("A")
        .and(&age_over(18).or(&age_under(5)).expect("same source"))
        .expect("same source");

    let f = filter.compiled().expect("compiles");
    assert_eq!(
        f.call1(&person("A", 20)).expect("evaluates"),
        Value::Bool(true)
    );
    assert_eq!(
        f.call1(&person("B", 20)).expect("evaluates"),
        Value::Bool(false)
    );
    assert_eq!(
        f.call1(&person("A", 10)).expect("evaluates"),
        Value::Bool(false)
    );
}

#[test]
fn invoke_inlining_compiles_and_evaluates() {
    // f = x => x + 1, applied to the literal 5.
    let x = Expr::parameter("x", TypeRef::int64());
    let f = Expr::lambda(
        vec![x.clone()],
        Expr::add(x.expr(), Expr::constant(Value::Int64(1))),
    );
    let applied = Expr::invoke(f, vec![Expr::constant(Value::Int64(5))]).expect("invokable");

    let expanded = expand(&applied).expect("expands");
    assert!(!expanded.any_node(&mut |node| matches!(node, Expr::Invoke { .. })));

    let thunk = compile(&Expr::lambda(Vec::new(), expanded)).expect("compiles");
    assert_eq!(thunk.call(&[]).expect("evaluates"), Value::Int64(6));
}

#[test]
fn expandable_shim_hides_invoke_composition_from_the_provider() {
    let rows: Vec<Value> = (0..10).map(|n| person("P", n * 10)).collect();
    let provider = RecordingSource::new(VecSource::new(person_ty(), rows));
    let queryable = as_expandable(provider);

    // Compose manually with invoke nodes, the way captured sub-filters do.
    let adult = age_over(17).expression().expect("materializes");
    let young = age_under(45).expression().expect("materializes");
    let p = Expr::parameter("p", person_ty());
    let body = Expr::and_also(
        Expr::invoke(Expr::captured("adult", adult), vec![p.expr()]).expect("invokable"),
        Expr::invoke(Expr::captured("young", young), vec![p.expr()]).expect("invokable"),
    );
    let composed = Expr::lambda(vec![p], body);

    let admitted = queryable.filter(&composed).expect("shim expands first");
    assert_eq!(admitted.len(), 3); // ages 20, 30, 40

    let seen = queryable.inner().seen();
    assert_eq!(seen.len(), 1);
    for tree in seen {
        assert!(!tree.any_node(&mut |node| matches!(node, Expr::Invoke { .. })));
        assert!(!tree.any_node(&mut |node| matches!(
            node,
            Expr::Member { member, .. } if member.declaring.is_synthesized_closure()
        )));
    }
}

#[test]
fn marker_wrapped_predicates_pass_through_the_shim() {
    let rows = vec![person("A", 3), person("B", 30)];
    let queryable = as_expandable(VecSource::new(person_ty(), rows));

    let marked = Expr::marked(age_under(10).expression().expect("materializes"));
    let admitted = queryable.filter(&marked).expect("marker strips");
    assert_eq!(admitted, vec![person("A", 3)]);
}

#[test]
fn filters_survive_a_wire_round_trip() {
    let filter = name_is("A")
        .and(&age_over(18))
        .expect("same source")
        .expression()
        .expect("materializes");

    let wire = serde_json::to_string(filter.as_ref()).expect("serializes");
    let back: Expr = serde_json::from_str(&wire).expect("deserializes");
    let back = Arc::new(back);

    assert!(are_equal(&filter, &back));
    let f = compile(&back).expect("compiles");
    assert_eq!(
        f.call1(&person("A", 20)).expect("evaluates"),
        Value::Bool(true)
    );
    assert_eq!(
        f.call1(&person("A", 2)).expect("evaluates"),
        Value::Bool(false)
    );
}
