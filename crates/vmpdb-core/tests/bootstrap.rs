//! Tests for the kernel bootstrap

mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{kernel_backend, kernel_codeview, Fixture, MockBackend, ScriptedPe, TypeTable, KERNEL_BASE, KERNEL_SIZE};

use vmpdb_core::memory::SparseMemory;
use vmpdb_core::pe::RSDS_SIGNATURE;
use vmpdb_core::symbols::{BootstrapMode, BootstrapState, Capabilities, InitOptions, PdbContext, PdbHandle};
use vmpdb_core::types::{Address, ProcessId};
use vmpdb_core::PdbError;

fn rsds_image(name: &[u8], at: usize) -> Vec<u8>
{
    let mut image = vec![0u8; 0x3000];
    let mut record = RSDS_SIGNATURE.to_le_bytes().to_vec();
    record.extend_from_slice(&[0x42; 16]);
    record.extend_from_slice(&3u32.to_le_bytes());
    record.extend_from_slice(name);
    record.push(0);
    image[at..at + record.len()].copy_from_slice(&record);
    image
}

#[test]
fn test_sync_bootstrap_enables()
{
    let fixture = Fixture::kernel(kernel_backend(TypeTable::new()));

    assert!(fixture.ctx.is_enabled());
    assert_eq!(fixture.ctx.bootstrap_state(), BootstrapState::Enabled);
    assert_eq!(fixture.backend.symbol_path().as_deref(), Some("srv*/tmp/Symbols"));

    let kernel = fixture.ctx.entry(PdbHandle::KERNEL).unwrap();
    assert_eq!(kernel.module_name(), "ntoskrnl");
    assert_eq!(kernel.debug_file_name(), "ntkrnlmp.pdb");
    assert_eq!(kernel.module_base(), Address::new(KERNEL_BASE));
    assert_eq!(kernel.module_size(), KERNEL_SIZE);
}

#[test]
fn test_supplied_codeview_wins()
{
    let supplied = common::module_codeview("ntkrnlpa.pdb", 7);
    let backend = MockBackend::new(TypeTable::new()).with_file("ntkrnlpa.pdb");
    let pe = ScriptedPe::new().with_module(KERNEL_BASE, KERNEL_SIZE, Some(kernel_codeview()));
    let fixture = Fixture::with_pe(backend, pe, Arc::new(SparseMemory::new()), Some(supplied));

    assert!(fixture.ctx.is_enabled());
    assert_eq!(fixture.ctx.entry(PdbHandle::KERNEL).unwrap().debug_file_name(), "ntkrnlpa.pdb");
}

#[test]
fn test_scan_fallback_enables()
{
    let memory = Arc::new(SparseMemory::new());
    memory.map(ProcessId::SYSTEM, Address::new(KERNEL_BASE), rsds_image(b"ntkrnlmp.pdb", 0x1000));
    let pe = ScriptedPe::new().with_module(KERNEL_BASE, KERNEL_SIZE, None);
    let fixture = Fixture::with_pe(kernel_backend(TypeTable::new()), pe, memory, None);

    assert!(fixture.ctx.is_enabled());
    let kernel = fixture.ctx.entry(PdbHandle::KERNEL).unwrap();
    assert_eq!(kernel.debug_file_name(), "ntkrnlmp.pdb");
    assert_eq!(kernel.age(), 3);
}

#[test]
fn test_scan_ignores_other_records()
{
    let memory = Arc::new(SparseMemory::new());
    memory.map(ProcessId::SYSTEM, Address::new(KERNEL_BASE), rsds_image(b"hal.pdb", 0x1000));
    let pe = ScriptedPe::new().with_module(KERNEL_BASE, KERNEL_SIZE, None);
    let fixture = Fixture::with_pe(kernel_backend(TypeTable::new()), pe, memory, None);

    assert!(!fixture.ctx.is_enabled());
    assert_eq!(fixture.ctx.bootstrap_state(), BootstrapState::Failed);
}

#[test]
fn test_missing_debug_info_leaves_disabled()
{
    let pe = ScriptedPe::new();
    let fixture = Fixture::with_pe(kernel_backend(TypeTable::new()), pe, Arc::new(SparseMemory::new()), None);

    assert!(!fixture.ctx.is_enabled());
    assert_eq!(fixture.ctx.bootstrap_state(), BootstrapState::Failed);
    assert_eq!(fixture.ctx.entry_count(), 0);
    assert!(matches!(fixture.ctx.type_size(PdbHandle::KERNEL, "_EPROCESS"), Err(PdbError::Disabled)));
    assert!(matches!(fixture.ctx.symbol_offset(PdbHandle::KERNEL, "KiSystemCall64"), Err(PdbError::Disabled)));
    assert_eq!(fixture.ctx.handle_from_module_name(None), None);
}

#[test]
fn test_missing_kernel_pdb_leaves_disabled()
{
    let fixture = Fixture::kernel(MockBackend::new(TypeTable::new()));

    assert!(!fixture.ctx.is_enabled());
    assert_eq!(fixture.ctx.bootstrap_state(), BootstrapState::Failed);
    assert_eq!(fixture.ctx.entry_count(), 1);
    assert_eq!(MockBackend::count(&fixture.backend.find_calls), 1);
    assert!(matches!(fixture.ctx.ensure_loaded(PdbHandle::KERNEL), Err(PdbError::Disabled)));
}

#[test]
fn test_async_bootstrap_completes()
{
    let backend = Arc::new(kernel_backend(TypeTable::new()));
    let pe = ScriptedPe::new().with_module(KERNEL_BASE, KERNEL_SIZE, Some(kernel_codeview()));
    let capabilities = Capabilities { backend: backend.clone(), pe: Arc::new(pe), memory: Arc::new(SparseMemory::new()) };
    let options = InitOptions { mode: BootstrapMode::Async, ..InitOptions::default() };

    let ctx = PdbContext::initialize(capabilities, common::kernel_target(), options).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !matches!(ctx.bootstrap_state(), BootstrapState::Enabled | BootstrapState::Failed) && Instant::now() < deadline {
        ctx.wait_bootstrap();
        thread::sleep(Duration::from_millis(10));
    }

    assert!(ctx.is_enabled());
    assert_eq!(ctx.bootstrap_state(), BootstrapState::Enabled);
    assert_eq!(ctx.symbol_offset(PdbHandle::KERNEL, "KiSystemCall64").unwrap(), 0x1000);

    ctx.close();
    assert_eq!(MockBackend::count(&backend.cleanup_calls), 1);
}
