//! # Caches Per-CPU de Ordem 0
//!
//! Alocações e liberações de uma página são o caso quente; cada CPU
//! mantém um pequeno estoque por tipo de migração para atendê-las sem
//! disputar o lock da zona. O estoque reabastece em lote (`batch`) e
//! transborda de volta ao buddy quando passa de `high`.
//!
//! Um deque por lista: a frente é a ponta quente (liberações recentes,
//! provável residência em cache), o fundo é a ponta fria. Páginas
//! estacionadas aqui NÃO contam como livres nas marcas d'água, igual ao
//! estoque não conta na prateleira.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use crate::buddy;
use crate::config::{PCP_BATCH_DIV, PCP_BATCH_MAX, PCP_HIGH_MULT};
use crate::migrate::{MigrateType, MIGRATE_PCP_TYPES};
use crate::page::{FrameTable, PageFlags};
use crate::stats::VmEvents;
use crate::zone::Zone;

/// Estoque de ordem 0 de uma CPU numa zona.
pub(crate) struct PerCpuPages {
    /// Uma lista por tipo de migração cacheável. Frente = quente.
    lists: [VecDeque<usize>; MIGRATE_PCP_TYPES],
    /// Total de páginas somando as listas.
    count: usize,
    /// Tamanho do saque/dreno em lote.
    batch: usize,
    /// Teto; atingido, drena `batch` de volta ao buddy.
    high: usize,
}

impl PerCpuPages {
    pub fn new() -> Self {
        Self {
            lists: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            count: 0,
            batch: 1,
            high: PCP_HIGH_MULT,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn high(&self) -> usize {
        self.high
    }

    fn set_sizes(&mut self, batch: usize, high: usize) {
        self.batch = batch;
        self.high = high;
    }
}

/// Lote proporcional à zona, com piso 1 e teto fixo.
pub(crate) fn compute_batch(managed_pages: usize) -> usize {
    (managed_pages / PCP_BATCH_DIV).clamp(1, PCP_BATCH_MAX)
}

/// Redimensiona os estoques de todas as CPUs da zona. Chamado quando o
/// total gerido muda (bootstrap, ajuste de tunables).
pub(crate) fn configure_zone(zone: &Zone) {
    let batch = compute_batch(zone.managed_pages());
    let high = PCP_HIGH_MULT * batch;
    for cpu in 0..zone.pcp_slots() {
        zone.pcp(cpu).lock().set_sizes(batch, high);
    }
}

/// Retira uma página de ordem 0 do estoque desta CPU, reabastecendo do
/// buddy se a lista do tipo estiver seca. `cold` pede a ponta fria.
pub(crate) fn alloc_page(
    zone: &Zone,
    frames: &FrameTable,
    events: &VmEvents,
    cpu: usize,
    mt: MigrateType,
    cold: bool,
    claim_order: usize,
) -> Option<usize> {
    debug_assert!(mt.is_pcp_type());
    let idx = mt.as_usize();
    let mut slot = zone.pcp(cpu).lock();
    let pcp = &mut *slot;

    if pcp.lists[idx].is_empty() {
        let batch = pcp.batch;
        let got = buddy::rmqueue_bulk(
            zone,
            frames,
            events,
            batch,
            mt,
            claim_order,
            &mut pcp.lists[idx],
        );
        if got == 0 {
            return None;
        }
        pcp.count += got;
        events.pcp_refills.fetch_add(1, Ordering::Relaxed);
        for &pfn in pcp.lists[idx].iter().rev().take(got) {
            let desc = frames.page(pfn);
            desc.set(PageFlags::PCP);
            desc.set_private(idx as u32);
        }
    }

    let pfn = if cold {
        pcp.lists[idx].pop_back()?
    } else {
        pcp.lists[idx].pop_front()?
    };
    pcp.count -= 1;
    drop(slot);

    let desc = frames.page(pfn);
    debug_assert!(desc.test(PageFlags::PCP));
    desc.reset_flags(PageFlags::empty());
    desc.set_private(0);
    desc.set_ref_count(1);
    Some(pfn)
}

/// Devolve uma página de ordem 0 ao estoque desta CPU. Páginas de
/// pageblocks isolados não são cacheadas; as de Reserve estacionam na
/// lista Movable.
pub(crate) fn free_page(
    zone: &Zone,
    frames: &FrameTable,
    events: &VmEvents,
    cpu: usize,
    pfn: usize,
    cold: bool,
) {
    let desc = frames.page(pfn);
    debug_assert_eq!(desc.ref_count(), 0);

    let block_type = zone.pageblock_type(pfn);
    if block_type == MigrateType::Isolate {
        // free_block espera flags zeradas.
        desc.reset_flags(PageFlags::empty());
        desc.set_private(0);
        buddy::free_block(zone, frames, pfn, 0);
        return;
    }
    let list_mt = if block_type.is_pcp_type() {
        block_type
    } else {
        MigrateType::Movable
    };

    desc.reset_flags(PageFlags::PCP);
    desc.set_private(list_mt.as_usize() as u32);

    let mut slot = zone.pcp(cpu).lock();
    let pcp = &mut *slot;
    if cold {
        pcp.lists[list_mt.as_usize()].push_back(pfn);
    } else {
        pcp.lists[list_mt.as_usize()].push_front(pfn);
    }
    pcp.count += 1;

    if pcp.count >= pcp.high {
        let batch = pcp.batch;
        drain_locked(pcp, zone, frames, events, batch);
    }
}

/// Esvazia o estoque desta CPU nesta zona. Devolve quantas páginas
/// voltaram ao buddy.
pub(crate) fn drain_cpu(zone: &Zone, frames: &FrameTable, events: &VmEvents, cpu: usize) -> usize {
    let mut slot = zone.pcp(cpu).lock();
    let count = slot.count;
    drain_locked(&mut slot, zone, frames, events, count)
}

/// Verte até `to_drain` páginas de volta ao buddy, alternando entre as
/// listas e sacando sempre da ponta fria.
fn drain_locked(
    pcp: &mut PerCpuPages,
    zone: &Zone,
    frames: &FrameTable,
    events: &VmEvents,
    to_drain: usize,
) -> usize {
    let mut victims = Vec::with_capacity(to_drain);
    let mut next = 0;
    'outer: while victims.len() < to_drain {
        for i in 0..MIGRATE_PCP_TYPES {
            let l = (next + i) % MIGRATE_PCP_TYPES;
            if let Some(pfn) = pcp.lists[l].pop_back() {
                pcp.count -= 1;
                let desc = frames.page(pfn);
                debug_assert!(desc.test(PageFlags::PCP));
                desc.reset_flags(PageFlags::empty());
                desc.set_private(0);
                victims.push(pfn);
                next = l + 1;
                continue 'outer;
            }
        }
        break;
    }
    let freed = victims.len();
    if freed > 0 {
        buddy::free_bulk(zone, frames, victims);
        events.pcp_drains.fetch_add(1, Ordering::Relaxed);
    }
    freed
}

// =============================================================================
// TESTES
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PAGEBLOCK_ORDER, PAGEBLOCK_PAGES};
    use crate::zone::{PfnRange, ZoneKind};

    const CLAIM: usize = PAGEBLOCK_ORDER / 2;

    fn booted(span: usize, batch: usize) -> (Zone, FrameTable, VmEvents) {
        let zone = Zone::new(ZoneKind::Normal, PfnRange::new(0, span));
        let frames = FrameTable::new(0, span);
        buddy::free_boot_range(&zone, &frames, PfnRange::new(0, span));
        zone.pcp(0).lock().set_sizes(batch, PCP_HIGH_MULT * batch);
        (zone, frames, VmEvents::new())
    }

    #[test]
    fn batch_scales_with_zone_and_saturates() {
        assert_eq!(compute_batch(100), 1);
        assert_eq!(compute_batch(4096), 4);
        assert_eq!(compute_batch(1 << 20), PCP_BATCH_MAX);
    }

    #[test]
    fn refill_pulls_a_whole_batch() {
        let (zone, frames, ev) = booted(64, 4);
        let pfn = alloc_page(&zone, &frames, &ev, 0, MigrateType::Movable, false, CLAIM).unwrap();
        // O lote saiu do buddy de uma vez; três ficaram estocadas.
        assert_eq!(zone.free_pages(), 60);
        assert_eq!(zone.pcp(0).lock().count(), 3);
        assert_eq!(ev.pcp_refills.load(Ordering::Relaxed), 1);
        assert_eq!(frames.page(pfn).ref_count(), 1);
        assert!(!frames.page(pfn).test(PageFlags::PCP));
    }

    #[test]
    fn hot_alloc_reuses_the_last_freed_page() {
        let (zone, frames, ev) = booted(64, 4);
        let a = alloc_page(&zone, &frames, &ev, 0, MigrateType::Movable, false, CLAIM).unwrap();
        let b = alloc_page(&zone, &frames, &ev, 0, MigrateType::Movable, false, CLAIM).unwrap();

        frames.page(a).set_ref_count(0);
        free_page(&zone, &frames, &ev, 0, a, false);
        frames.page(b).set_ref_count(0);
        free_page(&zone, &frames, &ev, 0, b, false);

        let hot = alloc_page(&zone, &frames, &ev, 0, MigrateType::Movable, false, CLAIM).unwrap();
        assert_eq!(hot, b);
    }

    #[test]
    fn cold_frees_sit_at_the_far_end() {
        let (zone, frames, ev) = booted(64, 4);
        let a = alloc_page(&zone, &frames, &ev, 0, MigrateType::Movable, false, CLAIM).unwrap();
        let b = alloc_page(&zone, &frames, &ev, 0, MigrateType::Movable, false, CLAIM).unwrap();

        // `a` volta frio, `b` volta quente.
        frames.page(a).set_ref_count(0);
        free_page(&zone, &frames, &ev, 0, a, true);
        frames.page(b).set_ref_count(0);
        free_page(&zone, &frames, &ev, 0, b, false);

        // Pedido frio saca da ponta fria; o quente não enxerga `a` antes
        // de esgotar o resto.
        let cold = alloc_page(&zone, &frames, &ev, 0, MigrateType::Movable, true, CLAIM).unwrap();
        assert_eq!(cold, a);
        let hot = alloc_page(&zone, &frames, &ev, 0, MigrateType::Movable, false, CLAIM).unwrap();
        assert_eq!(hot, b);
    }

    #[test]
    fn overflow_drains_one_batch_back() {
        let (zone, frames, ev) = booted(64, 2);
        // high = 12; encher até estourar.
        let mut held = Vec::new();
        for _ in 0..12 {
            held.push(alloc_page(&zone, &frames, &ev, 0, MigrateType::Movable, false, CLAIM).unwrap());
        }
        let before = zone.free_pages();
        for (i, pfn) in held.into_iter().enumerate() {
            frames.page(pfn).set_ref_count(0);
            free_page(&zone, &frames, &ev, 0, pfn, false);
            // O dreno dispara exatamente ao alcançar `high`.
            let pcp_count = zone.pcp(0).lock().count();
            if i + 1 < 12 {
                assert!(pcp_count < 12);
            }
        }
        assert_eq!(ev.pcp_drains.load(Ordering::Relaxed), 1);
        assert_eq!(zone.free_pages(), before + 2);
        assert_eq!(zone.pcp(0).lock().count(), 10);
    }

    #[test]
    fn drain_cpu_returns_everything_to_the_buddy() {
        let (zone, frames, ev) = booted(64, 4);
        let pfn = alloc_page(&zone, &frames, &ev, 0, MigrateType::Movable, false, CLAIM).unwrap();
        frames.page(pfn).set_ref_count(0);
        free_page(&zone, &frames, &ev, 0, pfn, false);
        assert_eq!(zone.pcp(0).lock().count(), 4);

        let drained = drain_cpu(&zone, &frames, &ev, 0);
        assert_eq!(drained, 4);
        assert_eq!(zone.pcp(0).lock().count(), 0);
        assert_eq!(zone.free_pages(), 64);
        // Tudo de volta e remesclado num bloco só.
        assert!(frames.page(pfn).test(PageFlags::BUDDY));
        assert_eq!(frames.page(pfn).buddy_order(), 6);
    }

    #[test]
    fn isolated_blocks_bypass_the_cache() {
        let (zone, frames, ev) = booted(2 * PAGEBLOCK_PAGES, 4);
        let pfn = alloc_page(&zone, &frames, &ev, 0, MigrateType::Movable, false, CLAIM).unwrap();
        drain_cpu(&zone, &frames, &ev, 0);

        zone.set_pageblock_type(pfn, MigrateType::Isolate);
        frames.page(pfn).set_ref_count(0);
        free_page(&zone, &frames, &ev, 0, pfn, false);
        // Nada estacionou no per-CPU; a página foi direto ao buddy.
        assert_eq!(zone.pcp(0).lock().count(), 0);
        assert!(frames.page(pfn).test(PageFlags::BUDDY));
    }

    #[test]
    fn isolated_free_scrubs_stray_flags_first() {
        let (zone, frames, ev) = booted(2 * PAGEBLOCK_PAGES, 4);
        let pfn = alloc_page(&zone, &frames, &ev, 0, MigrateType::Movable, false, CLAIM).unwrap();
        drain_cpu(&zone, &frames, &ev, 0);

        zone.set_pageblock_type(pfn, MigrateType::Isolate);
        frames.page(pfn).set(PageFlags::REFERENCED);
        frames.page(pfn).set_ref_count(0);
        free_page(&zone, &frames, &ev, 0, pfn, false);
        // O descritor entra no buddy limpo, sem flag herdada do dono.
        assert!(frames.page(pfn).test(PageFlags::BUDDY));
        assert!(!frames.page(pfn).test(PageFlags::REFERENCED));
    }
}
