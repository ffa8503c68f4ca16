//! # Configuração do Subsistema de Memória Física
//!
//! Define constantes de geometria, limites do buddy e parâmetros de reclaim.
//! Valores ajustáveis em runtime vivem em [`crate::node::Tunables`]; aqui
//! ficam apenas os que são estruturais (mudá-los exige recompilar).

use static_assertions::const_assert;
use static_assertions::const_assert_eq;

// =============================================================================
// GEOMETRIA DE PÁGINA
// =============================================================================

/// Tamanho de uma página (4 KiB)
pub const PAGE_SIZE: usize = 4096;

/// Bits de offset dentro de uma página
pub const PAGE_SHIFT: usize = 12;

/// Máscara para alinhar endereços a página
pub const PAGE_MASK: usize = !(PAGE_SIZE - 1);

// =============================================================================
// BUDDY SYSTEM
// =============================================================================

/// Número de ordens do buddy. Ordens válidas: `0..MAX_ORDER`.
/// Maior bloco alocável: 2^(MAX_ORDER-1) páginas = 4 MiB.
pub const MAX_ORDER: usize = 11;

/// Ordem de um pageblock (granularidade do tipo de migração).
/// 2^10 = 1024 páginas = 4 MiB por pageblock.
pub const PAGEBLOCK_ORDER: usize = MAX_ORDER - 1;

/// Páginas por pageblock
pub const PAGEBLOCK_PAGES: usize = 1 << PAGEBLOCK_ORDER;

/// Acima desta ordem uma alocação é considerada "cara": o slow path
/// desiste mais cedo e o OOM killer não é acionado por ela.
pub const PAGE_ALLOC_COSTLY_ORDER: usize = 3;

// =============================================================================
// CONFIGURAÇÃO SMP
// =============================================================================

/// Número máximo de CPUs suportadas
pub const MAX_CPUS: usize = 64;

/// Tamanho de linha de cache (para evitar false sharing)
pub const CACHE_LINE_SIZE: usize = 64;

// =============================================================================
// CACHE PER-CPU (PCP)
// =============================================================================

/// Divisor do tamanho da zona para derivar o `batch` do PCP
pub const PCP_BATCH_DIV: usize = 1024;

/// Teto do `batch` derivado (páginas movidas por refill/drain)
pub const PCP_BATCH_MAX: usize = 32;

/// `high` = `batch` * este fator (limite antes de drenar de volta)
pub const PCP_HIGH_MULT: usize = 6;

// =============================================================================
// CAMINHO LENTO DE ALOCAÇÃO
// =============================================================================

/// Rodadas de reclaim direto antes de uma alocação comum desistir.
/// Alocações `NO_FAIL` ignoram este teto e insistem indefinidamente.
pub const SLOWPATH_MAX_ROUNDS: usize = 16;

/// Esperas máximas no throttle de PFMEMALLOC antes de liberar o
/// reclaimer mesmo com a reserva ainda baixa.
pub const THROTTLE_MAX_WAITS: usize = 10;

/// Ordem default a partir da qual um fallback reivindica o pageblock
/// inteiro em vez de roubar só o bloco (ajustável via Tunables).
pub const DEFAULT_PAGEBLOCK_CLAIM_ORDER: usize = PAGEBLOCK_ORDER / 2;

// =============================================================================
// RECLAIM
// =============================================================================

/// Prioridade inicial de scan (coarseness): cada rodada examina
/// `tamanho_da_lista >> priority`; 0 = varredura total.
pub const DEF_PRIORITY: i32 = 12;

/// Lote máximo de páginas isoladas/recuperadas por passada
pub const SWAP_CLUSTER_MAX: usize = 32;

/// Espera curta quando o backing store está congestionado (ms)
pub const CONGESTION_WAIT_MS: u64 = 100;

/// Uma zona vira `all_unreclaimable` depois de escanear este múltiplo
/// das suas páginas recuperáveis sem liberar nada.
pub const UNRECLAIMABLE_SCAN_FACTOR: usize = 6;

/// Janela de decaimento das estatísticas rotated/scanned:
/// quando `recent_scanned` passa de `páginas_da_lista / este divisor`,
/// ambos os contadores são divididos por 2.
pub const RECENT_SCAN_WINDOW_DIV: usize = 4;

/// Abaixo desta prioridade o kswapd passa a escrever páginas sujas
/// de volta ao filesystem (reclaimers diretos nunca escrevem).
pub const KSWAPD_WRITEBACK_PRIORITY: i32 = DEF_PRIORITY - 2;

// =============================================================================
// WATERMARKS (defaults; ajustáveis via Tunables)
// =============================================================================

/// Reserva mínima global default, em páginas, rateada entre as zonas
pub const DEFAULT_MIN_FREE_PAGES: usize = 256;

/// Swappiness default (0..=200; maior favorece despejar páginas anônimas)
pub const DEFAULT_SWAPPINESS: u32 = 60;

/// Razões default de `lowmem_reserve`: proteção de uma zona baixa contra
/// alocações que poderiam ter ido para uma zona mais alta. Indexado pela
/// zona de origem da pressão; 0 = sem proteção.
pub const DEFAULT_LOWMEM_RESERVE_RATIO: [usize; 4] = [256, 256, 32, 0];

// =============================================================================
// VERIFICAÇÕES ESTRUTURAIS
// =============================================================================

const_assert!(PAGE_SIZE.is_power_of_two());
const_assert_eq!(1 << PAGE_SHIFT, PAGE_SIZE);
const_assert!(PAGEBLOCK_ORDER < MAX_ORDER);
const_assert!(PAGE_ALLOC_COSTLY_ORDER < MAX_ORDER);
const_assert!(SWAP_CLUSTER_MAX.is_power_of_two());

// =============================================================================
// FUNÇÕES UTILITÁRIAS
// =============================================================================

/// Alinha valor para cima ao múltiplo de align
#[inline(always)]
pub const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

/// Alinha valor para baixo ao múltiplo de align
#[inline(always)]
pub const fn align_down(val: usize, align: usize) -> usize {
    val & !(align - 1)
}

/// Verifica se valor está alinhado
#[inline(always)]
pub const fn is_aligned(val: usize, align: usize) -> bool {
    val & (align - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers_round_to_powers_of_two() {
        assert_eq!(align_up(0, PAGEBLOCK_PAGES), 0);
        assert_eq!(align_up(1, PAGEBLOCK_PAGES), PAGEBLOCK_PAGES);
        assert_eq!(align_up(PAGEBLOCK_PAGES, PAGEBLOCK_PAGES), PAGEBLOCK_PAGES);
        assert_eq!(align_down(PAGEBLOCK_PAGES + 7, PAGEBLOCK_PAGES), PAGEBLOCK_PAGES);
        assert!(is_aligned(0, 8));
        assert!(is_aligned(PAGE_SIZE, PAGE_SIZE));
        assert!(!is_aligned(PAGE_SIZE + 4, PAGE_SIZE));
    }
}
