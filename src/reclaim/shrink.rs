//! # Isolamento e Despejo
//!
//! O coração do reclaim: tira lotes da cauda das listas, decide página
//! a página entre recuperar, manter e reativar, e devolve os frames
//! limpos ao buddy num lote só. Nenhum lock de lista é segurado
//! durante o exame: as páginas saem isoladas (flag ISOLATED + uma
//! referência nossa) e só voltam no putback.

use alloc::vec::Vec;
use bitflags::bitflags;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::buddy;
use crate::config::{
    CONGESTION_WAIT_MS, DEF_PRIORITY, KSWAPD_WRITEBACK_PRIORITY, SWAP_CLUSTER_MAX,
    THROTTLE_MAX_WAITS,
};
use crate::hooks::{SwapSlot, UnmapOutcome, WriteOutcome, WritebackMode};
use crate::node::SystemMemory;
use crate::page::{FrameTable, PageFlags, NO_MAPPING};
use crate::zone::{Zone, ZONE_CONGESTED};

use super::lru::{stat_index, LruKind, LruSet};
use super::{ReclaimKind, ScanControl};

bitflags! {
    /// Restrições de isolamento impostas pelo scan-control. Páginas
    /// que o modo proíbe voltam para a cabeça da lista sem exame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct IsolateMode: u32 {
        /// Só páginas limpas (chamador não tolera IO bloqueante)
        const CLEAN_ONLY = 1 << 0;
        /// Só páginas fora de page tables
        const UNMAPPED_ONLY = 1 << 1;
    }
}

/// Veredito do exame de referências de uma página candidata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum References {
    Activate,
    Keep,
    Reclaim,
}

// =============================================================================
// CONTADORES AUXILIARES
// =============================================================================

fn isolated_counter(zone: &Zone, file: bool) -> &AtomicUsize {
    if file {
        &zone.counters.isolated_file
    } else {
        &zone.counters.isolated_anon
    }
}

/// Manada de reclaimers diretos: mais páginas isoladas do que restam na
/// inativa. Inflar ainda mais só atrapalha; quem chegou agora espera.
fn too_many_isolated(zone: &Zone, file: bool) -> bool {
    let (inactive, isolated) = if file {
        (
            zone.counters.lru_count(LruKind::InactiveFile),
            zone.counters.isolated_file.load(Ordering::Relaxed),
        )
    } else {
        (
            zone.counters.lru_count(LruKind::InactiveAnon),
            zone.counters.isolated_anon.load(Ordering::Relaxed),
        )
    };
    isolated > inactive
}

fn note_scanned(mem: &SystemMemory, kind: ReclaimKind, n: usize) {
    let counter = match kind {
        ReclaimKind::Kswapd => &mem.events.pgscan_kswapd,
        ReclaimKind::Direct => &mem.events.pgscan_direct,
    };
    counter.fetch_add(n as u64, Ordering::Relaxed);
}

fn note_stolen(mem: &SystemMemory, kind: ReclaimKind, n: usize) {
    let counter = match kind {
        ReclaimKind::Kswapd => &mem.events.pgsteal_kswapd,
        ReclaimKind::Direct => &mem.events.pgsteal_direct,
    };
    counter.fetch_add(n as u64, Ordering::Relaxed);
}

// =============================================================================
// ISOLAMENTO
// =============================================================================

/// Examina até `nr_to_scan` entradas da cauda de uma lista e isola as
/// elegíveis: saem com LRU limpo, ISOLATED setado e uma referência
/// nossa. Mlocked descoberta no caminho é desviada para a unevictable;
/// o que o modo proíbe volta para a cabeça. Retorna (examinadas,
/// isoladas).
fn isolate_lru_pages(
    lru: &mut LruSet,
    zone: &Zone,
    frames: &FrameTable,
    kind: LruKind,
    nr_to_scan: usize,
    mode: IsolateMode,
    out: &mut Vec<usize>,
) -> (usize, usize) {
    let base = zone.range().start;
    let mut scanned = 0;
    let mut taken = 0;

    while scanned < nr_to_scan {
        let Some(rel) = lru.pop_tail(kind) else {
            break;
        };
        scanned += 1;
        let pfn = base + rel as usize;
        let desc = frames.page(pfn);

        if desc.test(PageFlags::MLOCKED) || desc.test(PageFlags::UNEVICTABLE) {
            desc.set(PageFlags::UNEVICTABLE);
            desc.clear(PageFlags::ACTIVE);
            zone.counters.lru_sub(kind, 1);
            lru.push_head(rel, LruKind::Unevictable);
            zone.counters.lru_add(LruKind::Unevictable, 1);
            continue;
        }
        if mode.contains(IsolateMode::CLEAN_ONLY)
            && (desc.test(PageFlags::DIRTY) || desc.test(PageFlags::WRITEBACK))
        {
            lru.push_head(rel, kind);
            continue;
        }
        if mode.contains(IsolateMode::UNMAPPED_ONLY) && desc.is_mapped() {
            lru.push_head(rel, kind);
            continue;
        }
        if !desc.get_page_unless_zero() {
            // Última referência caindo em paralelo; o caminho de
            // liberação resolve sozinho.
            lru.push_head(rel, kind);
            continue;
        }

        desc.clear(PageFlags::LRU);
        desc.set(PageFlags::ISOLATED);
        zone.counters.lru_sub(kind, 1);
        out.push(pfn);
        taken += 1;
    }
    (scanned, taken)
}

// =============================================================================
// EXAME DE REFERÊNCIAS
// =============================================================================

/// Combina os bits de acesso das PTEs com o bit REFERENCED por
/// software. Anônima tocada, múltiplos toques ou código executável de
/// arquivo justificam reativar; um toque único rende uma segunda volta
/// na inativa.
fn page_check_references(mem: &SystemMemory, pfn: usize) -> References {
    let desc = mem.frames.page(pfn);
    let refs = mem.hooks.rmap.page_referenced(pfn);
    desc.test_and_clear(PageFlags::REFERENCED);

    if refs.ptes > 0 {
        if desc.is_anon() || refs.ptes > 1 || (refs.exec && !desc.is_anon()) {
            return References::Activate;
        }
        desc.set(PageFlags::REFERENCED);
        return References::Keep;
    }
    References::Reclaim
}

/// Página de swap cache resgatada da evicção: devolve o slot ao backing
/// store e desfaz a sujeira que a reserva criou. Chamar com a página
/// travada e sem lock de lista.
fn give_back_swap_slot(mem: &SystemMemory, zone: &Zone, pfn: usize) {
    let desc = mem.frames.page(pfn);
    if !desc.test_and_clear(PageFlags::SWAP_CACHE) {
        return;
    }
    let slot = SwapSlot(desc.private());
    desc.set_private(0);
    if desc.test_and_clear(PageFlags::DIRTY) {
        zone.counters.dirty.fetch_sub(1, Ordering::Relaxed);
    }
    mem.hooks.backing.swap_slot_free(slot);
}

// =============================================================================
// MÁQUINA POR PÁGINA
// =============================================================================

/// Saldo de uma passada de `shrink_page_list`.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct PageListStats {
    /// Páginas devolvidas ao buddy
    pub reclaimed: usize,
    /// Páginas encontradas ou postas sob writeback nesta passada
    pub congested: usize,
    /// Páginas promovidas de volta à ativa
    pub activated: usize,
}

/// Decide o destino de cada página isolada. Recuperadas são devolvidas
/// ao buddy num único lote; sobreviventes saem em `survivors` com o
/// veredito de reativação para o putback aplicar.
pub(crate) fn shrink_page_list(
    mem: &SystemMemory,
    zone: &Zone,
    sc: &ScanControl,
    pages: &[usize],
    survivors: &mut Vec<(usize, bool)>,
) -> PageListStats {
    let mut stats = PageListStats::default();
    let mut freed: Vec<usize> = Vec::new();

    for &pfn in pages {
        let desc = mem.frames.page(pfn);

        if !desc.trylock() {
            survivors.push((pfn, false));
            continue;
        }
        if desc.test(PageFlags::MLOCKED) || desc.test(PageFlags::UNEVICTABLE) {
            // O putback desvia para a unevictable.
            desc.unlock();
            survivors.push((pfn, false));
            continue;
        }
        if desc.test(PageFlags::WRITEBACK) {
            // IO em voo; só o embutidor pode concluí-lo.
            stats.congested += 1;
            desc.unlock();
            survivors.push((pfn, false));
            continue;
        }

        match page_check_references(mem, pfn) {
            References::Activate => {
                give_back_swap_slot(mem, zone, pfn);
                desc.unlock();
                stats.activated += 1;
                survivors.push((pfn, true));
                continue;
            }
            References::Keep => {
                desc.unlock();
                survivors.push((pfn, false));
                continue;
            }
            References::Reclaim => {}
        }

        // Anônima fora do swap cache: sem slot não há para onde ir.
        if desc.is_anon() && !desc.test(PageFlags::SWAP_CACHE) {
            if !sc.may_swap {
                desc.unlock();
                stats.activated += 1;
                survivors.push((pfn, true));
                continue;
            }
            match mem.hooks.backing.swap_slot_alloc(pfn) {
                Some(slot) => {
                    desc.set_private(slot.0);
                    desc.set(PageFlags::SWAP_CACHE | PageFlags::DIRTY);
                    zone.counters.dirty.fetch_add(1, Ordering::Relaxed);
                }
                None => {
                    // Swap esgotado; reativa para sair da frente.
                    desc.unlock();
                    stats.activated += 1;
                    survivors.push((pfn, true));
                    continue;
                }
            }
        }

        if desc.is_mapped() {
            if !sc.may_unmap {
                desc.unlock();
                survivors.push((pfn, false));
                continue;
            }
            match mem.hooks.rmap.try_to_unmap(pfn) {
                UnmapOutcome::Done => desc.set_map_count(0),
                UnmapOutcome::Busy => {
                    desc.unlock();
                    survivors.push((pfn, false));
                    continue;
                }
                UnmapOutcome::WouldDeadlock => {
                    give_back_swap_slot(mem, zone, pfn);
                    desc.unlock();
                    stats.activated += 1;
                    survivors.push((pfn, true));
                    continue;
                }
                UnmapOutcome::NewlyMlocked => {
                    desc.set(PageFlags::MLOCKED);
                    desc.unlock();
                    survivors.push((pfn, false));
                    continue;
                }
            }
        }

        if desc.test(PageFlags::DIRTY) {
            let file = !desc.is_anon();
            // Suja de arquivo só sai pela mão do kswapd, e apenas sob
            // pressão sustentada; o reclaim direto nunca entra no FS.
            let kswapd_may_write =
                sc.kind == ReclaimKind::Kswapd && sc.priority < KSWAPD_WRITEBACK_PRIORITY;
            if (file && !kswapd_may_write) || !sc.may_writepage {
                desc.set(PageFlags::RECLAIM);
                desc.unlock();
                survivors.push((pfn, false));
                continue;
            }
            match mem
                .hooks
                .backing
                .write_back(pfn, desc.mapping(), WritebackMode::Async)
            {
                WriteOutcome::Submitted => {
                    desc.clear(PageFlags::DIRTY);
                    desc.set(PageFlags::WRITEBACK | PageFlags::RECLAIM);
                    zone.counters.dirty.fetch_sub(1, Ordering::Relaxed);
                    zone.counters.writeback.fetch_add(1, Ordering::Relaxed);
                    mem.events.pageout.fetch_add(1, Ordering::Relaxed);
                    stats.congested += 1;
                    desc.unlock();
                    survivors.push((pfn, false));
                    continue;
                }
                WriteOutcome::Blocked => {
                    zone.flags.set(ZONE_CONGESTED);
                    stats.congested += 1;
                    desc.unlock();
                    survivors.push((pfn, false));
                    continue;
                }
                WriteOutcome::Error => {
                    give_back_swap_slot(mem, zone, pfn);
                    desc.unlock();
                    stats.activated += 1;
                    survivors.push((pfn, true));
                    continue;
                }
            }
        }

        // Limpa e desmapeada: congela a contagem (dono + isolamento) e
        // pede ao dono do índice que a esqueça.
        debug_assert_eq!(desc.map_count(), 0);
        if !desc.freeze_refs(2) {
            // Alguém pegou uma referência no meio do caminho.
            desc.unlock();
            survivors.push((pfn, false));
            continue;
        }
        let mapping = desc.mapping();
        if (mapping != NO_MAPPING || desc.test(PageFlags::SWAP_CACHE))
            && !mem.hooks.backing.remove_mapping(mapping, pfn)
        {
            desc.unfreeze_refs(2);
            desc.unlock();
            survivors.push((pfn, false));
            continue;
        }

        // Daqui em diante a página não existe para o resto do sistema.
        desc.set_mapping(NO_MAPPING);
        desc.set_private(0);
        desc.reset_flags(PageFlags::empty());
        #[cfg(feature = "mm_trace")]
        crate::ktrace!("(RECLAIM) pfn {:#x} evictado", pfn);
        freed.push(pfn);
        stats.reclaimed += 1;
    }

    if !freed.is_empty() {
        buddy::free_bulk(zone, &mem.frames, freed.iter().copied());
        mem.events
            .pgfree
            .fetch_add(stats.reclaimed as u64, Ordering::Relaxed);
    }
    stats
}

// =============================================================================
// PUTBACK
// =============================================================================

/// Devolve uma sobrevivente à lista adequada, revalidando a
/// evictabilidade, e solta a referência do isolamento. Se a nossa era a
/// última, a página morreu isolada: devolve o PFN para o chamador
/// liberar fora do lock de LRU.
fn putback_page(
    mem: &SystemMemory,
    zone: &Zone,
    lru: &mut LruSet,
    pfn: usize,
    activate: bool,
) -> Option<usize> {
    let desc = mem.frames.page(pfn);
    let rel = (pfn - zone.range().start) as u32;
    desc.clear(PageFlags::ISOLATED);

    if desc.put_page_testzero() {
        // O dono soltou enquanto a página estava isolada.
        desc.set_mapping(NO_MAPPING);
        desc.set_private(0);
        desc.reset_flags(PageFlags::empty());
        return Some(pfn);
    }

    if desc.test(PageFlags::MLOCKED) || desc.test(PageFlags::UNEVICTABLE) {
        desc.set(PageFlags::UNEVICTABLE);
        desc.clear(PageFlags::ACTIVE);
        desc.set(PageFlags::LRU);
        lru.push_head(rel, LruKind::Unevictable);
        zone.counters.lru_add(LruKind::Unevictable, 1);
        return None;
    }

    if activate {
        desc.set(PageFlags::ACTIVE);
        mem.events.pgactivate.fetch_add(1, Ordering::Relaxed);
    }
    let kind = LruKind::for_page(desc);
    desc.set(PageFlags::LRU);
    lru.push_head(rel, kind);
    zone.counters.lru_add(kind, 1);
    if activate {
        lru.recent_rotated[stat_index(kind.is_file())] += 1;
    }
    None
}

// =============================================================================
// SHRINK DA LISTA INATIVA
// =============================================================================

/// Um lote de reclaim sobre a cauda de uma lista inativa. Retorna
/// quantas páginas foram devolvidas ao buddy.
pub(crate) fn shrink_inactive_list(
    mem: &SystemMemory,
    zone: &Zone,
    sc: &mut ScanControl,
    nr_to_scan: usize,
    file: bool,
) -> usize {
    let mut waits = 0;
    while sc.kind == ReclaimKind::Direct && too_many_isolated(zone, file) {
        mem.hooks.sched.congestion_wait(CONGESTION_WAIT_MS);
        if mem.hooks.sched.fatal_signal_pending() {
            return 0;
        }
        waits += 1;
        if waits >= THROTTLE_MAX_WAITS {
            // Isolamento não recua; desiste do lote em vez de girar.
            crate::kwarn!("(PMM) lote de reclaim desistiu: isolamento saturado");
            return 0;
        }
    }

    let (inactive, _) = LruKind::pair(file);
    let mut batch: Vec<usize> = Vec::with_capacity(nr_to_scan.min(SWAP_CLUSTER_MAX));
    let (scanned, taken) = {
        let mut lru = zone.lru().lock();
        let r = isolate_lru_pages(
            &mut lru,
            zone,
            &mem.frames,
            inactive,
            nr_to_scan,
            sc.isolate_mode,
            &mut batch,
        );
        lru.recent_scanned[stat_index(file)] += r.1;
        r
    };

    sc.nr_scanned += scanned;
    zone.counters.pages_scanned.fetch_add(scanned, Ordering::Relaxed);
    note_scanned(mem, sc.kind, scanned);
    if taken == 0 {
        return 0;
    }
    isolated_counter(zone, file).fetch_add(taken, Ordering::Relaxed);

    let mut survivors: Vec<(usize, bool)> = Vec::with_capacity(taken);
    let stats = shrink_page_list(mem, zone, sc, &batch, &mut survivors);

    let mut dead: Vec<usize> = Vec::new();
    {
        let mut lru = zone.lru().lock();
        for &(pfn, activate) in &survivors {
            if let Some(p) = putback_page(mem, zone, &mut lru, pfn, activate) {
                dead.push(p);
            }
        }
    }
    isolated_counter(zone, file).fetch_sub(taken, Ordering::Relaxed);
    if !dead.is_empty() {
        let n = buddy::free_bulk(zone, &mem.frames, dead.iter().copied());
        mem.events.pgfree.fetch_add(n as u64, Ordering::Relaxed);
    }

    note_stolen(mem, sc.kind, stats.reclaimed);

    // Lote afogado em writeback: o veredito fica na zona para quem
    // consultar via wait_iff_congested.
    if stats.congested > taken / 2 {
        zone.flags.set(ZONE_CONGESTED);
    }
    // Freio proporcional à pressão: cada degrau de prioridade reduz à
    // metade a fração de writeback que já justifica esperar.
    if stats.congested > 0 && stats.congested >= taken >> (DEF_PRIORITY - sc.priority) as usize {
        super::wait_iff_congested(mem, zone, CONGESTION_WAIT_MS);
    }
    stats.reclaimed
}

// =============================================================================
// SHRINK DA LISTA ATIVA
// =============================================================================

/// Envelhece a cauda de uma lista ativa: código executável de arquivo
/// referenciado continua ativo, o resto desce para a inativa.
pub(crate) fn shrink_active_list(
    mem: &SystemMemory,
    zone: &Zone,
    sc: &mut ScanControl,
    nr_to_scan: usize,
    file: bool,
) {
    let (_, active) = LruKind::pair(file);
    let mut batch: Vec<usize> = Vec::with_capacity(nr_to_scan.min(SWAP_CLUSTER_MAX));
    let (scanned, taken) = {
        let mut lru = zone.lru().lock();
        let r = isolate_lru_pages(
            &mut lru,
            zone,
            &mem.frames,
            active,
            nr_to_scan,
            IsolateMode::empty(),
            &mut batch,
        );
        lru.recent_scanned[stat_index(file)] += r.1;
        r
    };

    sc.nr_scanned += scanned;
    zone.counters.pages_scanned.fetch_add(scanned, Ordering::Relaxed);
    note_scanned(mem, sc.kind, scanned);
    if taken == 0 {
        return;
    }
    isolated_counter(zone, file).fetch_add(taken, Ordering::Relaxed);

    // Exame fora do lock. Referência conta como rotação para o cálculo
    // de proporção, mas só exec de arquivo escapa da demoção.
    let mut referenced = 0;
    let mut keep_active: Vec<usize> = Vec::new();
    let mut demote: Vec<usize> = Vec::new();
    for &pfn in &batch {
        let desc = mem.frames.page(pfn);
        let refs = mem.hooks.rmap.page_referenced(pfn);
        if refs.ptes > 0 {
            referenced += 1;
            if refs.exec && !desc.is_anon() {
                keep_active.push(pfn);
                continue;
            }
        }
        desc.clear(PageFlags::ACTIVE);
        demote.push(pfn);
    }

    let demoted = demote.len();
    let mut dead: Vec<usize> = Vec::new();
    {
        let mut lru = zone.lru().lock();
        lru.recent_rotated[stat_index(file)] += referenced;
        for &pfn in keep_active.iter().chain(demote.iter()) {
            if let Some(p) = putback_page(mem, zone, &mut lru, pfn, false) {
                dead.push(p);
            }
        }
    }
    isolated_counter(zone, file).fetch_sub(taken, Ordering::Relaxed);
    if !dead.is_empty() {
        let n = buddy::free_bulk(zone, &mem.frames, dead.iter().copied());
        mem.events.pgfree.fetch_add(n as u64, Ordering::Relaxed);
    }
    mem.events
        .pgdeactivate
        .fetch_add(demoted as u64, Ordering::Relaxed);
}

// =============================================================================
// TESTES
// =============================================================================
