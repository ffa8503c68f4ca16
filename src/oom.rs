//! # Última Instância
//!
//! Quando o reclaim direto estagna e o chamador tem como esperar um
//! desfecho, alguém precisa morrer. A escolha e o abate da vítima são
//! do embutidor (hook de OOM); aqui ficam a serialização de matadores
//! concorrentes e a contabilidade.

use core::sync::atomic::Ordering;

use crate::config::CONGESTION_WAIT_MS;
use crate::gfp::GfpFlags;
use crate::hooks::OomVerdict;
use crate::node::SystemMemory;

/// Aciona o OOM killer. Retorna se vale repetir a alocação: alguém
/// morreu, ou outro contexto já está matando e o espólio vem aí.
pub(crate) fn out_of_memory(mem: &SystemMemory, order: usize, gfp: GfpFlags) -> bool {
    let Some(_guard) = mem.oom_lock.try_lock() else {
        mem.hooks.sched.congestion_wait(CONGESTION_WAIT_MS);
        return true;
    };

    match mem.hooks.oom.kill_victim(order, gfp) {
        OomVerdict::Killed => {
            mem.events.oom_kills.fetch_add(1, Ordering::Relaxed);
            crate::kwarn!(
                "(OOM) vítima abatida por alocação de ordem {} ({:?})",
                order,
                gfp
            );
            true
        }
        OomVerdict::NoVictim => {
            crate::kwarn!("(OOM) sem vítima elegível; exaustão é terminal");
            false
        }
    }
}

// =============================================================================
// TESTES
// =============================================================================
