//! Tests for error types

use trueno_xfold::Error;

#[test]
fn test_missing_input_error() {
    let error = Error::MissingInput("File /data/DY/mt_nominal.parquet does not exist".to_string());
    let error_str = format!("{error}");
    assert!(error_str.contains("Missing required input"));
    assert!(error_str.contains("mt_nominal.parquet"));
}

#[test]
fn test_count_mismatch_error() {
    let error = Error::CountMismatch {
        context: "fold partition".to_string(),
        expected: 10,
        actual: 9,
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("fold partition"));
    assert!(error_str.contains("expected 10"));
    assert!(error_str.contains("got 9"));
}

#[test]
fn test_numerical_divergence_error() {
    let error = Error::NumericalDivergence {
        step: 42,
        loss: f32::NAN,
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("step 42"));
    assert!(error_str.contains("NaN"));
    assert!(error_str.contains("no retry"));
}

#[test]
fn test_expression_error() {
    let error = Error::Expression("unknown function foo".to_string());
    let error_str = format!("{error}");
    assert!(error_str.contains("Expression error"));
    assert!(error_str.contains("foo"));
}

#[test]
fn test_storage_error() {
    let error = Error::StorageError("file not found".to_string());
    let error_str = format!("{error}");
    assert!(error_str.contains("Storage error"));
    assert!(error_str.contains("file not found"));
}

#[test]
fn test_invalid_input_error() {
    let error = Error::InvalidInput("batch_size must be positive".to_string());
    let error_str = format!("{error}");
    assert!(error_str.contains("Invalid input"));
    assert!(error_str.contains("batch_size must be positive"));
}

#[test]
fn test_io_error_conversion() {
    let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
    let error: Error = io_error.into();
    let error_str = format!("{error}");
    assert!(error_str.contains("IO error"));
}

#[test]
fn test_serialization_error_conversion() {
    let json_error = serde_json::from_str::<Vec<f32>>("{").unwrap_err();
    let error: Error = json_error.into();
    assert!(format!("{error}").contains("Serialization error"));
}

#[test]
fn test_other_error() {
    let error = Error::Other("custom error message".to_string());
    let error_str = format!("{error}");
    assert_eq!(error_str, "custom error message");
}

#[test]
fn test_error_debug() {
    let error = Error::MissingInput("x".to_string());
    let debug_str = format!("{error:?}");
    assert!(debug_str.contains("MissingInput"));
}

#[test]
fn test_result_type_alias_error() {
    fn returns_error() -> trueno_xfold::Result<i32> {
        Err(Error::Other("test error".to_string()))
    }

    let result = returns_error();
    assert!(result.is_err());
}
