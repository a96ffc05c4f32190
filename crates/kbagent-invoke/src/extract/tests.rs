use super::*;
use kbagent_graph::{idtf, MemoryKb};

fn setup() -> (MemoryKb, ResultExtractor) {
    let kb = MemoryKb::with_protocol_markers();
    let extractor = ResultExtractor::new(Arc::new(kb.clone()), idtf::NREL_RESULT);
    (kb, extractor)
}

fn action(kb: &MemoryKb) -> NodeRef {
    kb.create_node(NodeKind::Node).unwrap()
}

fn main_idtf_field(name: &str, cardinality: Cardinality) -> FieldSpec {
    FieldSpec::new(
        name,
        Pattern::new().triple_with_relation(
            Term::bound(VAR_MEMBER),
            EdgeKind::Common,
            Term::var_of(NodeKind::Link, "_name"),
            Term::idtf(idtf::NREL_MAIN_IDTF),
        ),
        "_name",
        ReadAs::Content,
        cardinality,
    )
}

#[test]
fn test_typed_int_scalar() {
    let (kb, extractor) = setup();
    let action = action(&kb);
    let link = kb.create_link("7").unwrap();
    kb.attach_result(action, &[link]).unwrap();

    let payload = extractor
        .extract(action, CompletionOutcome::Succeeded, &ResultSpec::TypedScalar(ScalarType::Int))
        .unwrap();
    assert_eq!(payload, Some(Payload::Int(7)));
}

#[test]
fn test_unparsable_scalar_keeps_raw_text() {
    let (kb, extractor) = setup();
    let action = action(&kb);
    let link = kb.create_link("seven").unwrap();
    kb.attach_result(action, &[link]).unwrap();

    let err = extractor
        .extract(action, CompletionOutcome::Succeeded, &ResultSpec::TypedScalar(ScalarType::Int))
        .unwrap_err();
    match err {
        ExtractError::Malformed(malformed) => assert_eq!(malformed.raw.as_deref(), Some("seven")),
        other => panic!("expected malformed result, got {other:?}"),
    }
}

#[test]
fn test_bool_scalar_forms() {
    for (raw, expected) in [("1", true), ("0", false), ("true", true), (" FALSE ", false)] {
        assert_eq!(
            parse_scalar(ScalarType::Bool, raw.to_string()).unwrap(),
            Payload::Bool(expected),
            "{raw:?}"
        );
    }
    assert!(parse_scalar(ScalarType::Bool, "yes".to_string()).is_err());
}

#[test]
fn test_missing_result_structure_is_malformed() {
    let (kb, extractor) = setup();
    let action = action(&kb);

    for spec in [
        ResultSpec::ScalarLink,
        ResultSpec::RecordList(RecordSpec::new(NodeKind::Node)),
    ] {
        let err = extractor
            .extract(action, CompletionOutcome::Succeeded, &spec)
            .unwrap_err();
        assert!(matches!(err, ExtractError::Malformed(_)), "{spec:?}: {err:?}");
    }
}

#[test]
fn test_unit_ignores_result_structure() {
    let (kb, extractor) = setup();
    let action = action(&kb);

    let payload = extractor
        .extract(action, CompletionOutcome::Succeeded, &ResultSpec::Unit)
        .unwrap();
    assert_eq!(payload, Some(Payload::Unit));
}

#[test]
fn test_unsuccessful_outcomes_extract_nothing() {
    let (kb, extractor) = setup();
    let action = action(&kb);

    for outcome in [CompletionOutcome::Failed, CompletionOutcome::Errored] {
        let payload = extractor
            .extract(action, outcome, &ResultSpec::ScalarLink)
            .unwrap();
        assert_eq!(payload, None);
    }
}

#[test]
fn test_empty_structure_is_empty_list() {
    let (kb, extractor) = setup();
    let action = action(&kb);
    kb.attach_result(action, &[]).unwrap();

    let spec = ResultSpec::RecordList(
        RecordSpec::new(NodeKind::Node).field(main_idtf_field("title", Cardinality::One)),
    );
    let payload = extractor
        .extract(action, CompletionOutcome::Succeeded, &spec)
        .unwrap();
    assert_eq!(payload, Some(Payload::Records(Vec::new())));
}

#[test]
fn test_record_fields_by_cardinality() {
    let (kb, extractor) = setup();
    let action = action(&kb);

    let titled = kb.create_node(NodeKind::Node).unwrap();
    kb.set_main_idtf(titled, "Article 1").unwrap();
    let untitled = kb.create_node(NodeKind::Node).unwrap();
    let body = kb.create_link("body text").unwrap();
    kb.attach_result(action, &[titled, untitled, body]).unwrap();

    let spec = ResultSpec::RecordList(
        RecordSpec::new(NodeKind::Node)
            .field(FieldSpec::member_node("node"))
            .field(main_idtf_field("title", Cardinality::Optional))
            .field(main_idtf_field("aliases", Cardinality::Many)),
    );
    let records = extractor
        .extract(action, CompletionOutcome::Succeeded, &spec)
        .unwrap()
        .and_then(Payload::into_records)
        .unwrap();

    // The link member does not satisfy the Node kind.
    assert_eq!(records.len(), 2);
    let first = records.iter().find(|r| r.member == titled).unwrap();
    assert_eq!(first.text("title"), Some("Article 1"));
    assert_eq!(first.texts("aliases"), vec!["Article 1".to_string()]);
    assert_eq!(first.node("node"), Some(titled));

    let second = records.iter().find(|r| r.member == untitled).unwrap();
    assert_eq!(second.get("title"), Some(&FieldValue::Absent));
    assert_eq!(second.get("aliases"), Some(&FieldValue::Texts(Vec::new())));
}

#[test]
fn test_required_field_missing_is_malformed() {
    let (kb, extractor) = setup();
    let action = action(&kb);
    let member = kb.create_node(NodeKind::Node).unwrap();
    kb.attach_result(action, &[member]).unwrap();

    let spec = ResultSpec::RecordList(
        RecordSpec::new(NodeKind::Node).field(main_idtf_field("title", Cardinality::One)),
    );
    let err = extractor
        .extract(action, CompletionOutcome::Succeeded, &spec)
        .unwrap_err();
    assert!(matches!(err, ExtractError::Malformed(_)));
}

#[test]
fn test_member_class_filter() {
    let (kb, extractor) = setup();
    kb.define_marker("belarus_legal_article", NodeKind::Class);
    let action = action(&kb);

    let article = kb.create_node(NodeKind::Node).unwrap();
    kb.add_to_class("belarus_legal_article", article).unwrap();
    let other = kb.create_node(NodeKind::Node).unwrap();
    kb.attach_result(action, &[article, other]).unwrap();

    let spec = ResultSpec::RecordList(
        RecordSpec::new(NodeKind::Node)
            .member_class("belarus_legal_article")
            .field(FieldSpec::member_node("article")),
    );
    let records = extractor
        .extract(action, CompletionOutcome::Succeeded, &spec)
        .unwrap()
        .and_then(Payload::into_records)
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].member, article);
}

#[test]
fn test_content_field_on_non_link_is_malformed() {
    let (kb, extractor) = setup();
    let action = action(&kb);
    let member = kb.create_node(NodeKind::Node).unwrap();
    kb.attach_result(action, &[member]).unwrap();

    let spec = ResultSpec::RecordList(
        RecordSpec::new(NodeKind::Node).field(FieldSpec::member_content("content")),
    );
    let err = extractor
        .extract(action, CompletionOutcome::Succeeded, &spec)
        .unwrap_err();
    assert!(matches!(err, ExtractError::Malformed(_)));
}

#[test]
fn test_result_spec_json_shape() {
    let spec = ResultSpec::TypedScalar(ScalarType::Int);
    let json = serde_json::to_value(&spec).unwrap();
    assert_eq!(json, serde_json::json!({"shape": "typed_scalar", "spec": "int"}));
    let back: ResultSpec = serde_json::from_value(json).unwrap();
    assert_eq!(back, spec);
}

#[test]
fn test_scalar_read_propagates_transport_errors() {
    use crate::testing::FaultyKb;

    let kb = MemoryKb::with_protocol_markers();
    let action = action(&kb);
    let link = kb.create_link("7").unwrap();
    let structure = kb.attach_result(action, &[link]).unwrap();

    // The structure read fails; the member link itself is still readable.
    let transport = FaultyKb::new(kb)
        .failing_reads(TransportError::Disconnected)
        .only(structure);
    let extractor = ResultExtractor::new(Arc::new(transport), idtf::NREL_RESULT);
    let err = extractor
        .extract(action, CompletionOutcome::Succeeded, &ResultSpec::TypedScalar(ScalarType::Int))
        .unwrap_err();
    assert!(
        matches!(err, ExtractError::Transport(TransportError::Disconnected)),
        "{err:?}"
    );
}

#[test]
fn test_succeeded_extraction_always_yields_payload_or_malformed() {
    let (kb, extractor) = setup();
    let bare = action(&kb);
    assert_eq!(extractor.extract_succeeded(bare, &ResultSpec::Unit).unwrap(), Payload::Unit);
    let err = extractor.extract_succeeded(bare, &ResultSpec::ScalarLink).unwrap_err();
    assert!(matches!(err, ExtractError::Malformed(_)), "{err:?}");

    let answered = action(&kb);
    let link = kb.create_link("done").unwrap();
    kb.attach_result(answered, &[link]).unwrap();
    assert_eq!(
        extractor.extract_succeeded(answered, &ResultSpec::ScalarLink).unwrap(),
        Payload::Text("done".to_string())
    );
}
