//! Validates contract fixtures against frozen JSON schemas.

use jsonschema::JSONSchema;
use serde_json::Value;

fn load_json(path: &str) -> Value {
    let raw = std::fs::read_to_string(path).expect("json file should be readable");
    serde_json::from_str(&raw).expect("json file should be valid")
}

fn compile_validator(schema_path: &str) -> JSONSchema {
    let schema = load_json(schema_path);
    JSONSchema::compile(&schema).expect("schema should compile")
}

#[test]
fn run_summary_fixture_matches_schema() {
    let validator = compile_validator(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../../contracts/run-summary.schema.json"
    ));
    let fixture = load_json(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../../contracts/fixtures/run-summary.valid.json"
    ));
    assert!(
        validator.is_valid(&fixture),
        "run summary fixture should validate against schema"
    );
}

#[test]
fn weight_variant_manifest_fixture_matches_schema() {
    let validator = compile_validator(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../../contracts/weight-variant-manifest.schema.json"
    ));
    let fixture = load_json(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../../contracts/fixtures/weight-variant-manifest.valid.json"
    ));
    assert!(
        validator.is_valid(&fixture),
        "weight variant manifest fixture should validate against schema"
    );
}

#[test]
fn run_summary_fixture_rejects_unknown_model_variant() {
    let validator = compile_validator(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../../contracts/run-summary.schema.json"
    ));
    let mut fixture = load_json(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../../contracts/fixtures/run-summary.valid.json"
    ));
    fixture["model_variant"] = Value::String("not-a-real-variant".to_string());
    assert!(
        !validator.is_valid(&fixture),
        "an unknown model variant should fail schema validation"
    );
}
