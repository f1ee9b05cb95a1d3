//! Tests for error handling

use vmpdb_core::backend::BackendError;
use vmpdb_core::types::Address;
use vmpdb_core::{MemoryError, PdbError, PeError, Result};

#[test]
fn test_pdb_error_display()
{
    let error = PdbError::FieldNotFound { type_name: "_EPROCESS".into(), field: "Nope".into() };
    let message = format!("{}", error);
    assert!(message.contains("_EPROCESS"));
    assert!(message.contains("Nope"));

    let error = PdbError::UnknownHandle(0x1234);
    assert!(format!("{}", error).contains("0x0000000000001234"));
}

#[test]
fn test_load_failed_names_module()
{
    let error = PdbError::LoadFailed { module: "tcpip".into() };
    assert!(format!("{}", error).contains("tcpip"));
}

#[test]
fn test_backend_error_converts()
{
    let error: PdbError = BackendError::SymbolNotFound("KiSystemCall64".into()).into();
    match error {
        PdbError::Backend(BackendError::SymbolNotFound(name)) => assert_eq!(name, "KiSystemCall64"),
        other => panic!("Expected Backend variant, got {other:?}"),
    }
}

#[test]
fn test_memory_error_converts()
{
    let memory = MemoryError::Partial { address: Address::new(0x1000), read: 4, requested: 8 };
    let message = format!("{}", memory);
    assert!(message.contains("4 of 8"));

    let error: PdbError = memory.into();
    assert!(matches!(error, PdbError::Memory(MemoryError::Partial { read: 4, .. })));
}

#[test]
fn test_pe_error_converts()
{
    let error: PdbError = PeError::NoCodeView.into();
    assert!(matches!(error, PdbError::Pe(PeError::NoCodeView)));
}

#[test]
fn test_io_error_converts()
{
    let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing image");
    let error: PdbError = io.into();
    assert!(format!("{}", error).contains("missing image"));
}

#[test]
fn test_result_type()
{
    let _result: Result<()> = Ok(());
    let _error_result: Result<()> = Err(PdbError::Disabled);
}
