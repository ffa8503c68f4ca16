//! # Caminhos de Alocação
//!
//! O fast path percorre a zonelist na marca baixa e sai pelo cache
//! per-CPU ou pelo buddy. Quem não consegue cai no slow path, que
//! escala em estágios: acorda o kswapd, re-testa com os privilégios do
//! chamador, entra em reclaim direto e, esgotado isso, aciona o OOM
//! killer. As flags GFP decidem até qual estágio a requisição vai e
//! quando ela desiste.

use core::sync::atomic::Ordering;

use bitflags::bitflags;

use crate::buddy;
use crate::config::{CONGESTION_WAIT_MS, PAGE_ALLOC_COSTLY_ORDER, SLOWPATH_MAX_ROUNDS};
use crate::error::{MmError, MmResult};
use crate::gfp::GfpFlags;
use crate::migrate::MigrateType;
use crate::node::SystemMemory;
use crate::oom;
use crate::page::RunInfo;
use crate::pcp;
use crate::reclaim;
use crate::zone::{WatermarkLevel, Zone, ZoneKind};

// =============================================================================
// PRIVILÉGIOS DE WATERMARK
// =============================================================================

bitflags! {
    /// Quanto da reserva abaixo da marca este chamador pode comer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct AllocFlags: u32 {
        /// Contexto que não pode dormir: marca reduzida em 1/4
        const HARDER = 1 << 0;
        /// Prioridade alta: marca reduzida pela metade
        const HIGH = 1 << 1;
        /// Caminho do próprio reclaim: nenhuma marca se aplica
        const NO_WATERMARKS = 1 << 2;
    }
}

/// Traduz as flags GFP nos privilégios de admissão do slow path.
pub(crate) fn gfp_to_alloc_flags(gfp: GfpFlags) -> AllocFlags {
    let mut flags = AllocFlags::empty();
    if gfp.contains(GfpFlags::HIGH_PRIORITY) {
        flags |= AllocFlags::HIGH;
    }
    if gfp.is_atomic() {
        flags |= AllocFlags::HARDER;
    }
    if gfp.contains(GfpFlags::MEMALLOC) {
        flags |= AllocFlags::NO_WATERMARKS;
    }
    flags
}

/// Admissão de uma zona: aplica os privilégios sobre a marca pedida e
/// soma a proteção de lowmem contra a classe do chamador.
pub(crate) fn watermark_gate(
    zone: &Zone,
    order: usize,
    level: WatermarkLevel,
    classzone: ZoneKind,
    flags: AllocFlags,
) -> bool {
    if flags.contains(AllocFlags::NO_WATERMARKS) {
        return true;
    }
    let mut mark = zone.watermark(level);
    if flags.contains(AllocFlags::HIGH) {
        mark -= mark / 2;
    }
    if flags.contains(AllocFlags::HARDER) {
        mark -= mark / 4;
    }
    zone.watermark_ok(order, mark, zone.lowmem_reserve(classzone))
}

// =============================================================================
// ZONELIST
// =============================================================================

/// Percorre as zonas elegíveis, da mais alta para a mais baixa, e tira
/// um bloco da primeira que passa na admissão. Ordem 0 sai pelo cache
/// per-CPU; ordens maiores vão direto ao buddy.
pub(crate) fn get_page_from_freelist(
    mem: &SystemMemory,
    order: usize,
    gfp: GfpFlags,
    mt: MigrateType,
    level: WatermarkLevel,
    flags: AllocFlags,
    classzone: ZoneKind,
) -> Option<RunInfo> {
    let claim_order = mem.tunables.claim_order();
    let cold = gfp.contains(GfpFlags::COLD);

    for zone in mem.zones_for(classzone) {
        if zone.managed_pages() == 0 {
            continue;
        }
        if !watermark_gate(zone, order, level, classzone, flags) {
            // Com o modo habilitado, tenta aliviar esta zona antes de
            // descer para a próxima; só vale para quem pode dormir.
            if !mem.tunables.zone_reclaim_enabled() || !gfp.contains(GfpFlags::MAY_WAIT) {
                continue;
            }
            if reclaim::zone_reclaim(mem, zone, order, gfp) == 0 {
                continue;
            }
            if !watermark_gate(zone, order, level, classzone, flags) {
                continue;
            }
        }

        let pfn = if order == 0 && mt.is_pcp_type() {
            let cpu = mem.hooks.sched.current_cpu();
            pcp::alloc_page(zone, &mem.frames, &mem.events, cpu, mt, cold, claim_order)
        } else {
            buddy::rmqueue(zone, &mem.frames, &mem.events, order, mt, claim_order)
        };
        if let Some(pfn) = pfn {
            return Some(RunInfo {
                pfn,
                order,
                migratetype: mt,
            });
        }
    }
    None
}

// =============================================================================
// SLOW PATH
// =============================================================================

/// Próxima etapa da escalada. O slow path roda como um laço sobre este
/// valor; cada braço executa a etapa e devolve a transição seguinte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlowpathStep {
    /// Acorda o kswapd e re-testa na marca mínima com os privilégios
    /// do chamador.
    WakeKswapd,
    /// Uma rodada de reclaim direto, com re-teste na marca baixa se
    /// houve progresso.
    DirectReclaim,
    /// Reclaim estagnado: repesca na marca alta e, ainda de mãos
    /// vazias, aciona o OOM killer.
    Oom,
    /// Fecha a rodada: desiste pelos limites do chamador ou espera a
    /// fila andar e volta ao reclaim.
    Backoff,
    /// Sem mais o que escalar.
    GiveUp,
}

/// Escalada quando o fast path falhou. Retorna o bloco ou o motivo
/// terminal da desistência.
pub(crate) fn allocate_slowpath(
    mem: &SystemMemory,
    order: usize,
    gfp: GfpFlags,
    mt: MigrateType,
    classzone: ZoneKind,
) -> MmResult<RunInfo> {
    mem.events.pgalloc_slowpath.fetch_add(1, Ordering::Relaxed);

    let flags = gfp_to_alloc_flags(gfp);
    let mut pages_reclaimed = 0usize;
    let mut rounds = 0usize;
    let mut step = SlowpathStep::WakeKswapd;

    loop {
        step = match step {
            SlowpathStep::WakeKswapd => {
                // A pressão existe mesmo que esta requisição se resolva
                // com privilégio: o kswapd começa a repor desde já.
                mem.wake_kswapd(order, classzone);

                // Re-teste na marca mínima, agora com os privilégios do
                // chamador.
                if let Some(run) = get_page_from_freelist(
                    mem,
                    order,
                    gfp,
                    mt,
                    WatermarkLevel::Min,
                    flags,
                    classzone,
                ) {
                    return Ok(run);
                }

                // Privilégio total: o reclaim pedindo páginas para poder
                // avançar. NO_FAIL aqui insiste até a fila andar.
                if flags.contains(AllocFlags::NO_WATERMARKS) {
                    loop {
                        if let Some(run) = get_page_from_freelist(
                            mem,
                            order,
                            gfp,
                            mt,
                            WatermarkLevel::Min,
                            flags,
                            classzone,
                        ) {
                            return Ok(run);
                        }
                        if !gfp.contains(GfpFlags::NO_FAIL) || gfp.is_atomic() {
                            break;
                        }
                        mem.hooks.sched.congestion_wait(CONGESTION_WAIT_MS);
                    }
                }

                if gfp.is_atomic() {
                    return Err(MmError::OutOfMemory);
                }
                // Quem já está dentro do reclaim não pode reclamar de
                // novo.
                if gfp.contains(GfpFlags::MEMALLOC) {
                    return Err(MmError::OutOfMemory);
                }
                SlowpathStep::DirectReclaim
            }

            SlowpathStep::DirectReclaim => {
                rounds += 1;
                if mem.hooks.sched.fatal_signal_pending() {
                    return Err(MmError::OutOfMemory);
                }
                if reclaim::throttle_direct_reclaim(mem, gfp, classzone) {
                    return Err(MmError::OutOfMemory);
                }

                let progress = reclaim::try_to_free_pages(mem, gfp, classzone);
                pages_reclaimed += progress;

                if progress > 0 {
                    if let Some(run) = get_page_from_freelist(
                        mem,
                        order,
                        gfp,
                        mt,
                        WatermarkLevel::Low,
                        flags,
                        classzone,
                    ) {
                        return Ok(run);
                    }
                    SlowpathStep::Backoff
                } else if gfp.contains(GfpFlags::MAY_WRITE_FS)
                    && !gfp.contains(GfpFlags::NO_RETRY)
                {
                    SlowpathStep::Oom
                } else {
                    SlowpathStep::Backoff
                }
            }

            SlowpathStep::Oom => {
                // Antes de matar alguém, repesca na marca alta: a vítima
                // de um OOM concorrente pode já ter devolvido memória
                // suficiente.
                if let Some(run) = get_page_from_freelist(
                    mem,
                    order,
                    gfp,
                    mt,
                    WatermarkLevel::High,
                    flags,
                    classzone,
                ) {
                    return Ok(run);
                }
                // Matar um processo não materializa blocos contíguos de
                // ordem alta.
                if order > PAGE_ALLOC_COSTLY_ORDER && !gfp.contains(GfpFlags::NO_FAIL) {
                    SlowpathStep::GiveUp
                } else if !oom::out_of_memory(mem, order, gfp) && !gfp.contains(GfpFlags::NO_FAIL) {
                    SlowpathStep::GiveUp
                } else {
                    SlowpathStep::Backoff
                }
            }

            SlowpathStep::Backoff => {
                let bounded = !gfp.contains(GfpFlags::NO_FAIL);
                if bounded && gfp.contains(GfpFlags::NO_RETRY) {
                    SlowpathStep::GiveUp
                } else if bounded
                    && order > PAGE_ALLOC_COSTLY_ORDER
                    && pages_reclaimed >= (1 << order)
                {
                    SlowpathStep::GiveUp
                } else if bounded && rounds >= SLOWPATH_MAX_ROUNDS {
                    SlowpathStep::GiveUp
                } else {
                    mem.hooks.sched.congestion_wait(CONGESTION_WAIT_MS);
                    SlowpathStep::DirectReclaim
                }
            }

            SlowpathStep::GiveUp => {
                crate::kwarn!(
                    "(PMM) falha de alocação: ordem {}, gfp {:?}, {} páginas recuperadas em {} rodadas",
                    order,
                    gfp,
                    pages_reclaimed,
                    rounds
                );
                return Err(MmError::OutOfMemory);
            }
        };
    }
}

// =============================================================================
// TESTES
// =============================================================================
