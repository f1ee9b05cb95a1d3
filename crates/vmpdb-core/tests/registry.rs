//! Tests for PDB registration and handle lookup

mod common;

use common::{kernel_backend, module_codeview, Fixture, ScriptedPe, KERNEL_BASE, KERNEL_SIZE};
use std::sync::Arc;

use vmpdb_core::memory::SparseMemory;
use vmpdb_core::symbols::{PdbHandle, KERNEL_MODULE_NAME, MAX_MODULE_SIZE};
use vmpdb_core::types::{Address, ProcessId};
use vmpdb_core::PdbError;

const TCPIP_BASE: u64 = 0xffff_f800_1000_0000;

#[test]
fn test_add_module_entry_is_idempotent()
{
    let fixture = Fixture::kernel(kernel_backend(common::TypeTable::new()));
    let codeview = module_codeview("tcpip.pdb", 1);

    let first = fixture.ctx.add_module_entry(Address::new(TCPIP_BASE), 0x1000, "tcpip", &codeview).unwrap();
    let second = fixture.ctx.add_module_entry(Address::new(TCPIP_BASE + 0x1000), 0x2000, "other", &codeview).unwrap();

    assert_eq!(first, second);
    assert_eq!(fixture.ctx.entry_count(), 2);
    let entry = fixture.ctx.entry(first).unwrap();
    assert_eq!(entry.module_name(), "tcpip");
    assert_eq!(entry.module_base(), Address::new(TCPIP_BASE));
}

#[test]
fn test_kernel_name_synonyms()
{
    let fixture = Fixture::kernel(kernel_backend(common::TypeTable::new()));

    let by_default = fixture.ctx.handle_from_module_name(None).unwrap();
    assert_eq!(fixture.ctx.handle_from_module_name(Some("nt")), Some(by_default));
    assert_eq!(fixture.ctx.handle_from_module_name(Some(KERNEL_MODULE_NAME)), Some(by_default));
    assert_ne!(by_default, PdbHandle::KERNEL);
    assert_eq!(fixture.ctx.module_name(PdbHandle::KERNEL).unwrap(), KERNEL_MODULE_NAME);
}

#[test]
fn test_module_name_collision_keeps_first()
{
    let fixture = Fixture::kernel(kernel_backend(common::TypeTable::new()));
    let first = fixture
        .ctx
        .add_module_entry(Address::new(TCPIP_BASE), 0x1000, "tcpip", &module_codeview("tcpip.pdb", 1))
        .unwrap();
    let second = fixture
        .ctx
        .add_module_entry(Address::new(TCPIP_BASE + 0x10_0000), 0x1000, "tcpip", &module_codeview("tcpip.pdb", 2))
        .unwrap();

    assert_ne!(first, second);
    assert_eq!(fixture.ctx.handle_from_module_name(Some("tcpip")), Some(first));
    assert_eq!(fixture.ctx.handle_from_module_name(Some("TCPIP")), Some(first));
    assert!(fixture.ctx.entry(second).is_some());
}

#[test]
fn test_unknown_module_name()
{
    let fixture = Fixture::kernel(kernel_backend(common::TypeTable::new()));
    assert_eq!(fixture.ctx.handle_from_module_name(Some("ndis")), None);
}

#[test]
fn test_unknown_handle()
{
    let fixture = Fixture::kernel(kernel_backend(common::TypeTable::new()));
    let bogus = PdbHandle::from_raw(0x1234);

    assert!(fixture.ctx.entry(bogus).is_none());
    assert!(matches!(fixture.ctx.type_size(bogus, "_EPROCESS"), Err(PdbError::UnknownHandle(0x1234))));
    assert!(matches!(fixture.ctx.type_size(PdbHandle::from_raw(0), "_EPROCESS"), Err(PdbError::UnknownHandle(0))));
}

fn module_fixture(size: u32, with_codeview: bool) -> Fixture
{
    let codeview = with_codeview.then(|| module_codeview("tcpip.pdb", 9));
    let pe = ScriptedPe::new()
        .with_module(KERNEL_BASE, KERNEL_SIZE, Some(common::kernel_codeview()))
        .with_module(TCPIP_BASE, size, codeview);
    Fixture::with_pe(kernel_backend(common::TypeTable::new()), pe, Arc::new(SparseMemory::new()), None)
}

#[test]
fn test_handle_from_module_address_registers_once()
{
    let fixture = module_fixture(0x0010_0000, true);

    let handle = fixture.ctx.handle_from_module_address(ProcessId::SYSTEM, Address::new(TCPIP_BASE)).unwrap();
    assert_eq!(fixture.ctx.module_name(handle).unwrap(), "tcpip");
    assert_eq!(fixture.ctx.entry_count(), 2);

    let again = fixture.ctx.handle_from_module_address(ProcessId(4242), Address::new(TCPIP_BASE)).unwrap();
    assert_eq!(handle, again);
    assert_eq!(fixture.ctx.entry_count(), 2);
}

#[test]
fn test_handle_from_module_address_does_not_load()
{
    let fixture = module_fixture(0x0010_0000, true);
    let handle = fixture.ctx.handle_from_module_address(ProcessId::SYSTEM, Address::new(TCPIP_BASE)).unwrap();
    assert!(fixture.ctx.entry(handle).unwrap().load_state().is_none());
}

#[test]
fn test_handle_from_module_address_rejects_sizes()
{
    let empty = module_fixture(0, true);
    assert!(empty.ctx.handle_from_module_address(ProcessId::SYSTEM, Address::new(TCPIP_BASE)).is_none());

    let huge = module_fixture(MAX_MODULE_SIZE + 1, true);
    assert!(huge.ctx.handle_from_module_address(ProcessId::SYSTEM, Address::new(TCPIP_BASE)).is_none());

    let largest = module_fixture(MAX_MODULE_SIZE, true);
    assert!(largest.ctx.handle_from_module_address(ProcessId::SYSTEM, Address::new(TCPIP_BASE)).is_some());
}

#[test]
fn test_handle_from_module_address_without_codeview()
{
    let fixture = module_fixture(0x1000, false);
    assert!(fixture.ctx.handle_from_module_address(ProcessId::SYSTEM, Address::new(TCPIP_BASE)).is_none());
    assert!(fixture.ctx.handle_from_module_address(ProcessId::SYSTEM, Address::new(0xdead_0000)).is_none());
    assert_eq!(fixture.ctx.entry_count(), 1);
}

#[test]
fn test_close_releases_everything()
{
    let fixture = Fixture::kernel(kernel_backend(common::TypeTable::new()));
    fixture.ctx.add_module_entry(Address::new(TCPIP_BASE), 0x1000, "tcpip", &module_codeview("tcpip.pdb", 1));

    fixture.ctx.close();
    assert_eq!(fixture.ctx.entry_count(), 0);
    assert_eq!(common::MockBackend::count(&fixture.backend.unload_calls), 1);
    assert_eq!(common::MockBackend::count(&fixture.backend.cleanup_calls), 1);
    assert!(!fixture.ctx.is_enabled());
    assert!(matches!(fixture.ctx.type_size(PdbHandle::KERNEL, "_EPROCESS"), Err(PdbError::NotInitialized)));
    assert!(fixture
        .ctx
        .add_module_entry(Address::new(TCPIP_BASE), 0x1000, "tcpip", &module_codeview("tcpip.pdb", 1))
        .is_none());

    fixture.ctx.close();
    assert_eq!(common::MockBackend::count(&fixture.backend.cleanup_calls), 1);
}
