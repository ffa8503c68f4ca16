//! # Motor de Reclaim
//!
//! Dado um orçamento de scan, escolhe candidatos nas listas LRU, decide
//! quem pode ser despejado com segurança e devolve os frames ao buddy.
//! Roda em dois contextos: síncrono no alocador travado (reclaim
//! direto) e na thread de background (kswapd). O orçamento afina com a
//! prioridade: cada rodada examina `tamanho >> priority`, e priority 0
//! varre tudo.

pub mod kswapd;
pub mod lru;
pub(crate) mod shrink;

use core::sync::atomic::Ordering;

use crate::config::{
    CONGESTION_WAIT_MS, DEF_PRIORITY, RECENT_SCAN_WINDOW_DIV, SWAP_CLUSTER_MAX,
    THROTTLE_MAX_WAITS,
};
use crate::gfp::GfpFlags;
use crate::node::SystemMemory;
use crate::zone::{WatermarkLevel, Zone, ZoneKind, ZONE_CONGESTED};

use self::lru::{LruKind, LRU_EVICTABLE};
use self::shrink::IsolateMode;

/// Prioridade inicial do reclaim dirigido a uma única zona.
const ZONE_RECLAIM_PRIORITY: i32 = 4;

// =============================================================================
// SCAN CONTROL
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReclaimKind {
    /// Alocador travado reclamando por conta própria
    Direct,
    /// Daemon de background balanceando o nó
    Kswapd,
}

/// Parâmetros de uma invocação do reclaim. Efêmero: um por chamada,
/// nunca persistido.
pub(crate) struct ScanControl {
    pub kind: ReclaimKind,
    /// Coarseness: cada rodada examina `tamanho_da_lista >> priority`
    pub priority: i32,
    /// Pode submeter writeback (arquivo continua restrito ao kswapd)
    pub may_writepage: bool,
    /// Pode desfazer mapeamentos de page tables
    pub may_unmap: bool,
    /// Pode consumir slots de swap
    pub may_swap: bool,
    pub nr_to_reclaim: usize,
    pub nr_scanned: usize,
    pub nr_reclaimed: usize,
    /// Restrições de isolamento derivadas do contexto do chamador
    pub isolate_mode: IsolateMode,
}

impl ScanControl {
    pub fn direct(gfp: GfpFlags) -> Self {
        let may_writepage = gfp.contains(GfpFlags::MAY_WRITE_FS);
        let mut isolate_mode = IsolateMode::empty();
        if !may_writepage {
            // Quem não pode entrar no FS não deve nem carregar sujas.
            isolate_mode |= IsolateMode::CLEAN_ONLY;
        }
        Self {
            kind: ReclaimKind::Direct,
            priority: DEF_PRIORITY,
            may_writepage,
            may_unmap: true,
            may_swap: true,
            nr_to_reclaim: SWAP_CLUSTER_MAX,
            nr_scanned: 0,
            nr_reclaimed: 0,
            isolate_mode,
        }
    }

    pub fn kswapd() -> Self {
        Self {
            kind: ReclaimKind::Kswapd,
            priority: DEF_PRIORITY,
            may_writepage: true,
            may_unmap: true,
            may_swap: true,
            nr_to_reclaim: usize::MAX,
            nr_scanned: 0,
            nr_reclaimed: 0,
            isolate_mode: IsolateMode::empty(),
        }
    }
}

// =============================================================================
// PROPORÇÃO DE SCAN
// =============================================================================

/// Quantas páginas examinar de cada lista evictable nesta rodada.
///
/// A proporção anon/file parte do swappiness e é corrigida pela razão
/// rotated/scanned de cada classe: lista cujas páginas voltam ativadas
/// rende pouco e é penalizada. Sem swap, anon fica de fora por
/// completo; se livre + arquivo ameaça cair abaixo da marca alta, o
/// scan anônimo é forçado para o cache de arquivo não sumir. Prioridade
/// 0 ignora a proporção e varre tudo que puder.
pub(crate) fn get_scan_count(
    zone: &Zone,
    sc: &ScanControl,
    swappiness: u32,
    swap_enabled: bool,
) -> [usize; 4] {
    let anon = zone.counters.lru_count(LruKind::ActiveAnon)
        + zone.counters.lru_count(LruKind::InactiveAnon);
    let file = zone.counters.lru_count(LruKind::ActiveFile)
        + zone.counters.lru_count(LruKind::InactiveFile);

    let no_anon = !swap_enabled || !sc.may_swap;
    let (percent_anon, percent_file) = if no_anon {
        (0, 100)
    } else if zone.free_pages() + file <= zone.watermark(WatermarkLevel::High) {
        (100, 0)
    } else {
        let mut lru = zone.lru().lock();
        if lru.recent_scanned[0] > anon / RECENT_SCAN_WINDOW_DIV {
            lru.recent_scanned[0] /= 2;
            lru.recent_rotated[0] /= 2;
        }
        if lru.recent_scanned[1] > file / RECENT_SCAN_WINDOW_DIV {
            lru.recent_scanned[1] /= 2;
            lru.recent_rotated[1] /= 2;
        }
        let anon_prio = swappiness as usize;
        let file_prio = 200 - swappiness as usize;
        let ap = (anon_prio + 1) * (lru.recent_scanned[0] + 1) / (lru.recent_rotated[0] + 1);
        let fp = (file_prio + 1) * (lru.recent_scanned[1] + 1) / (lru.recent_rotated[1] + 1);
        let pa = ap * 100 / (ap + fp);
        (pa, 100 - pa)
    };

    let mut nr = [0usize; 4];
    let mut lru = zone.lru().lock();
    for kind in LRU_EVICTABLE {
        let idx = kind.as_usize();
        let percent = if kind.is_file() {
            percent_file
        } else {
            percent_anon
        };
        let mut scan = zone.counters.lru_count(kind) >> sc.priority as usize;
        if sc.priority > 0 || no_anon {
            scan = scan * percent / 100;
        }
        // Restos acumulam até valer um lote inteiro.
        let acc = lru.saved_scan[idx] + scan;
        if acc >= SWAP_CLUSTER_MAX {
            lru.saved_scan[idx] = 0;
            nr[idx] = acc;
        } else {
            lru.saved_scan[idx] = acc;
            nr[idx] = 0;
        }
    }
    nr
}

// =============================================================================
// SHRINK DE UMA ZONA
// =============================================================================

/// Uma passada de reclaim sobre as listas de uma zona, em lotes
/// round-robin até esgotar o orçamento da rodada ou o pedido ser
/// satisfeito.
pub(crate) fn shrink_zone(mem: &SystemMemory, zone: &Zone, sc: &mut ScanControl) {
    let swappiness = mem.tunables.swappiness();
    let swap_enabled = mem.hooks.backing.swap_enabled();
    let mut nr = get_scan_count(zone, sc, swappiness, swap_enabled);

    while nr.iter().any(|&n| n > 0) {
        for kind in LRU_EVICTABLE {
            let idx = kind.as_usize();
            if nr[idx] == 0 {
                continue;
            }
            let chunk = nr[idx].min(SWAP_CLUSTER_MAX);
            nr[idx] -= chunk;
            if kind.is_active() {
                shrink::shrink_active_list(mem, zone, sc, chunk, kind.is_file());
            } else {
                sc.nr_reclaimed += shrink::shrink_inactive_list(mem, zone, sc, chunk, kind.is_file());
            }
        }
        if sc.nr_reclaimed >= sc.nr_to_reclaim && sc.priority < DEF_PRIORITY {
            break;
        }
    }

    // Envelhecimento anônimo: mesmo sem orçamento nesta rodada, a lista
    // inativa precisa continuar abastecida para as próximas.
    if swap_enabled
        && zone.counters.lru_count(LruKind::ActiveAnon)
            > zone.counters.lru_count(LruKind::InactiveAnon)
    {
        shrink::shrink_active_list(mem, zone, sc, SWAP_CLUSTER_MAX, false);
    }
}

// =============================================================================
// RECLAIM DIRETO
// =============================================================================

/// Entrada do reclaim síncrono: o alocador roda o motor na própria
/// zonelist, endurecendo a prioridade a cada rodada sem progresso.
pub(crate) fn try_to_free_pages(mem: &SystemMemory, gfp: GfpFlags, classzone: ZoneKind) -> usize {
    mem.events.allocstall.fetch_add(1, Ordering::Relaxed);
    let swap_enabled = mem.hooks.backing.swap_enabled();
    let mut sc = ScanControl::direct(gfp);

    for priority in (0..=DEF_PRIORITY).rev() {
        if mem.hooks.sched.fatal_signal_pending() {
            break;
        }
        sc.priority = priority;
        sc.nr_scanned = 0;

        let mut lru_pages = 0usize;
        for zone in mem.zones_for(classzone) {
            if zone.managed_pages() == 0 {
                continue;
            }
            if zone.is_all_unreclaimable() && priority != DEF_PRIORITY {
                continue;
            }
            lru_pages += zone.reclaimable_pages(swap_enabled);
            shrink_zone(mem, zone, &mut sc);
        }

        // Slab no mesmo compasso do scan de LRU desta rodada.
        mem.shrinkers.shrink_all(&mem.events, sc.nr_scanned, lru_pages.max(1));

        if sc.nr_reclaimed >= sc.nr_to_reclaim {
            break;
        }
        // Scan andando sem render: respiro antes de endurecer mais, se
        // a zona preferida estiver mesmo congestionada.
        if sc.nr_scanned > 0 && priority < DEF_PRIORITY - 2 {
            if let Some(preferred) = mem.zones_for(classzone).find(|z| z.managed_pages() > 0) {
                wait_iff_congested(mem, preferred, CONGESTION_WAIT_MS);
            }
        }
    }
    sc.nr_reclaimed
}

/// Dorme só se a zona carrega o veredito de congestionamento; sem ele,
/// o chamador segue sem pagar o atraso. O veredito é posto pelo
/// reclaim quando um lote afoga em writeback e derrubado pelo kswapd
/// quando a zona volta à marca alta.
pub(crate) fn wait_iff_congested(mem: &SystemMemory, zone: &Zone, msecs: u64) {
    if !zone.flags.test(ZONE_CONGESTED) {
        return;
    }
    mem.hooks.sched.congestion_wait(msecs);
}

/// Reclaim dirigido a uma única zona que falhou a admissão, antes de o
/// alocador descer para a próxima da lista. Só roda com o modo
/// habilitado nos tunables.
pub(crate) fn zone_reclaim(mem: &SystemMemory, zone: &Zone, order: usize, gfp: GfpFlags) -> usize {
    if zone.is_all_unreclaimable() {
        return 0;
    }
    let mut sc = ScanControl::direct(gfp);
    sc.nr_to_reclaim = SWAP_CLUSTER_MAX.max(1 << order);

    let mut priority = ZONE_RECLAIM_PRIORITY;
    while priority >= 0 && sc.nr_reclaimed < sc.nr_to_reclaim {
        sc.priority = priority;
        shrink_zone(mem, zone, &mut sc);
        priority -= 1;
    }
    sc.nr_reclaimed
}

// =============================================================================
// THROTTLE DA RESERVA (PFMEMALLOC)
// =============================================================================

/// A reserva abaixo de `min` ainda está utilizável? Falso quando mais
/// da metade já foi consumida.
fn pfmemalloc_ok(mem: &SystemMemory, classzone: ZoneKind) -> bool {
    let mut free = 0usize;
    let mut reserve = 0usize;
    for zone in mem.zones_for(classzone) {
        if zone.managed_pages() == 0 {
            continue;
        }
        free += zone.free_pages();
        reserve += zone.watermark(WatermarkLevel::Min);
    }
    reserve == 0 || free > reserve / 2
}

/// Freia um reclaimer direto comum quando a reserva de emergência está
/// mais da metade consumida, para o reclaim não devorar as páginas de
/// que ele próprio precisa para avançar. Retorna true se o chamador
/// deve abortar (sinal fatal durante a espera).
pub(crate) fn throttle_direct_reclaim(
    mem: &SystemMemory,
    gfp: GfpFlags,
    classzone: ZoneKind,
) -> bool {
    // O caminho privilegiado é exatamente quem a reserva serve.
    if gfp.contains(GfpFlags::MEMALLOC) {
        return false;
    }
    if pfmemalloc_ok(mem, classzone) {
        return false;
    }

    mem.events.pfmemalloc_throttled.fetch_add(1, Ordering::Relaxed);
    crate::kdebug!("(PMM) reclaim direto freado: reserva de emergência no limite");

    if !gfp.contains(GfpFlags::MAY_WRITE_FS) {
        // Contexto restrito não pode esperar o kswapd indefinidamente.
        mem.hooks.sched.congestion_wait(CONGESTION_WAIT_MS);
        return mem.hooks.sched.fatal_signal_pending();
    }

    for _ in 0..THROTTLE_MAX_WAITS {
        mem.wake_kswapd(0, classzone);
        mem.hooks.sched.congestion_wait(CONGESTION_WAIT_MS);
        if mem.hooks.sched.fatal_signal_pending() {
            return true;
        }
        if pfmemalloc_ok(mem, classzone) {
            break;
        }
    }
    false
}

// =============================================================================
// TESTES
// =============================================================================
