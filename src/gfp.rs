//! # Flags de Contexto de Alocação (GFP)
//!
//! O chamador descreve o que a alocação *pode* fazer (bloquear, escrever no
//! filesystem, usar a zona alta) e o que ela *é* (atômica, movível, código).
//! O slow path e o reclaim leem estas flags para decidir até onde escalar.

use bitflags::bitflags;

use crate::migrate::MigrateType;
use crate::zone::ZoneKind;

bitflags! {
    /// Bundle de opções de uma requisição de alocação.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GfpFlags: u32 {
        /// Pode bloquear: dormir em throttle, entrar em reclaim direto
        const MAY_WAIT = 1 << 0;
        /// Reclaim pode escrever páginas sujas de volta ao filesystem
        const MAY_WRITE_FS = 1 << 1;
        /// Elegível para a zona mais alta (highmem/movable)
        const MAY_USE_HIGHMEM = 1 << 2;
        /// Restrita à zona DMA
        const DMA = 1 << 3;
        /// Restrita às zonas até DMA32
        const DMA32 = 1 << 4;
        /// Uma única rodada de reclaim, sem retry
        const NO_RETRY = 1 << 5;
        /// Loop até conseguir; nunca retorna falha
        const NO_FAIL = 1 << 6;
        /// Zera o conteúdo antes de retornar ao chamador
        const ZERO_FILL = 1 << 7;
        /// Página destinada a código executável
        const EXEC = 1 << 8;
        /// Prioridade alta (contexto de interrupção/realtime):
        /// watermark reduzido pela metade
        const HIGH_PRIORITY = 1 << 9;
        /// Caminho do próprio reclaim: ignora watermarks por completo
        const MEMALLOC = 1 << 10;
        /// Página fria: vai para a cauda do cache per-CPU
        const COLD = 1 << 11;
        /// Dica de mobilidade: conteúdo movível (páginas de usuário)
        const MOVABLE = 1 << 12;
        /// Dica de mobilidade: recuperável (caches de kernel com shrinker)
        const RECLAIMABLE = 1 << 13;

        // === Bundles convencionais ===

        /// Alocação comum de kernel: pode bloquear e escrever no FS
        const KERNEL = Self::MAY_WAIT.bits() | Self::MAY_WRITE_FS.bits();
        /// Contexto atômico: nunca bloqueia, come metade da reserva
        const ATOMIC = Self::HIGH_PRIORITY.bits();
        /// Kernel dentro de caminho de FS: pode bloquear mas não reentrar no FS
        const NOFS = Self::MAY_WAIT.bits();
        /// Página de usuário na zona alta
        const HIGHUSER = Self::MAY_WAIT.bits()
            | Self::MAY_WRITE_FS.bits()
            | Self::MAY_USE_HIGHMEM.bits();
        /// Página de usuário movível (o caso dominante)
        const HIGHUSER_MOVABLE = Self::HIGHUSER.bits() | Self::MOVABLE.bits();
    }
}

impl GfpFlags {
    /// Tipo de migração preferido derivado das dicas de mobilidade.
    pub fn migratetype(self) -> MigrateType {
        if self.contains(Self::MOVABLE) {
            MigrateType::Movable
        } else if self.contains(Self::RECLAIMABLE) {
            MigrateType::Reclaimable
        } else {
            MigrateType::Unmovable
        }
    }

    /// Zona mais alta que esta requisição pode usar.
    pub fn highest_zone(self) -> ZoneKind {
        if self.contains(Self::DMA) {
            ZoneKind::Dma
        } else if self.contains(Self::DMA32) {
            ZoneKind::Dma32
        } else if self.contains(Self::MAY_USE_HIGHMEM) {
            ZoneKind::Movable
        } else {
            ZoneKind::Normal
        }
    }

    /// Requisição que não pode alcançar nenhum ponto de suspensão.
    pub fn is_atomic(self) -> bool {
        !self.contains(Self::MAY_WAIT)
    }
}
