//! # Self-Test de Boot
//!
//! Bateria curta que o kernel embutidor pode rodar na subida, depois de
//! entregar o bootmem. Cada teste monta um nó sintético próprio com os
//! ganchos nulos; falha derruba o boot com pânico, que é onde um
//! subsistema de memória quebrado deve parar.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::config::MAX_ORDER;
use crate::gfp::GfpFlags;
use crate::hooks::HookSet;
use crate::node::{MemorySpan, SystemMemory};
use crate::zone::{PfnRange, WatermarkLevel, ZoneKind};

/// Executa a bateria completa.
pub fn run_mm_tests() {
    crate::kinfo!("(MmTest) Iniciando self-test do subsistema de memória...");

    test_bootstrap_accounting();
    test_alloc_free_cycle();
    test_watermark_derivation();
    test_atomic_reserve();
    test_lru_promotion();

    crate::kinfo!("(MmTest) Todos os testes passaram!");
}

fn check(cond: bool, what: &str) {
    if cond {
        crate::kok!("(MmTest) {}", what);
    } else {
        crate::kfail!("(MmTest) {}", what);
        panic!("self-test de memória falhou: {}", what);
    }
}

fn test_node(pages: usize) -> Arc<SystemMemory> {
    let spans = [MemorySpan {
        kind: ZoneKind::Normal,
        range: PfnRange::new(0, pages),
    }];
    let mem = SystemMemory::new(&spans, HookSet::null());
    mem.free_bootmem(PfnRange::new(0, pages));
    mem
}

fn test_bootstrap_accounting() {
    let mem = test_node(2048);
    let zone = mem.zone(ZoneKind::Normal);
    check(zone.managed_pages() == 2048, "bootmem contabilizado");
    check(zone.free_pages() == 2048, "todas as páginas livres");
    check(
        zone.free_areas().lock().nr_free_order(MAX_ORDER - 1) == 2,
        "bootmem fundido em blocos máximos",
    );
}

fn test_alloc_free_cycle() {
    let mem = test_node(2048);
    let zone = mem.zone(ZoneKind::Normal);

    let small = mem.allocate(0, GfpFlags::KERNEL).expect("ordem 0");
    let big = mem.allocate(3, GfpFlags::KERNEL).expect("ordem 3");
    check(small.pages() == 1 && big.pages() == 8, "tamanhos corretos");
    drop(small);
    drop(big);
    mem.drain_all();
    check(zone.free_pages() == 2048, "conservação após o ciclo");
    let snap = mem.event_snapshot();
    check(snap.pgalloc == snap.pgfree, "contadores batem");
}

fn test_watermark_derivation() {
    let mem = test_node(2048);
    mem.set_min_free_pages(256);
    let zone = mem.zone(ZoneKind::Normal);
    check(zone.watermark(WatermarkLevel::Min) == 256, "marca mínima");
    check(
        zone.watermark(WatermarkLevel::Low) == 320,
        "marca baixa = min + min/4",
    );
    check(
        zone.watermark(WatermarkLevel::High) == 384,
        "marca alta = min + min/2",
    );
}

fn test_atomic_reserve() {
    let mem = test_node(256);
    mem.set_min_free_pages(64);
    let zone = mem.zone(ZoneKind::Normal);

    let mut held = Vec::new();
    while let Ok(run) = mem.allocate(0, GfpFlags::KERNEL) {
        held.push(run);
    }
    check(
        zone.free_pages() < zone.watermark(WatermarkLevel::Min),
        "KERNEL parou na reserva",
    );
    let emergency = mem.allocate(0, GfpFlags::ATOMIC);
    check(emergency.is_ok(), "ATOMIC morde a reserva");
}

fn test_lru_promotion() {
    let mem = test_node(256);
    let zone = mem.zone(ZoneKind::Normal);

    let run = mem.allocate(0, GfpFlags::KERNEL).expect("página de cache");
    let pfn = run.pfn();
    mem.lru_add(run, 1);
    mem.mark_accessed(pfn);
    mem.mark_accessed(pfn);
    check(
        zone.usage().active_file == 1,
        "segundo toque promoveu para a lista ativa",
    );
}
