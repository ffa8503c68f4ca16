//! # Descritor de Página Física
//!
//! Um descritor por frame, indexado por PFN. Todos os campos são atômicos:
//! o descritor é lido/escrito sob locks diferentes conforme o estado da
//! página (lock da zona para estado buddy, lock de LRU para estado LRU,
//! bit LOCKED para o exame individual do reclaim).
//!
//! Estados mutuamente exclusivos de uma página:
//! - livre no buddy (`BUDDY`, `private` = ordem), dona: exatamente uma
//!   free list;
//! - estacionada num cache per-CPU (`PCP`, `private` = tipo de migração);
//! - alocada (ref_count >= 1), dona: o chamador;
//! - residente em exatamente uma lista LRU (`LRU` +/- `ACTIVE`).

use core::sync::atomic::{AtomicU32, Ordering};

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;

use crate::migrate::MigrateType;
use crate::node::SystemMemory;

/// Id opaco do address space dono da página (0 = nenhum/anônima)
pub type MappingId = u32;

/// Valor de `mapping` para páginas sem address space
pub const NO_MAPPING: MappingId = 0;

bitflags! {
    /// Bits de estado de um descritor de página.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// Trancada para exame/IO (trylock via CAS)
        const LOCKED = 1 << 0;
        /// Bit de referência por software (segunda chance)
        const REFERENCED = 1 << 1;
        /// Conteúdo diverge do backing store
        const DIRTY = 1 << 2;
        /// Writeback em andamento
        const WRITEBACK = 1 << 3;
        /// Membro de alguma lista LRU
        const LRU = 1 << 4;
        /// Na metade ativa do LRU
        const ACTIVE = 1 << 5;
        /// Anônima/shmem: o backing é swap
        const SWAP_BACKED = 1 << 6;
        /// Fora do alcance do reclaim (ex.: mlock)
        const UNEVICTABLE = 1 << 7;
        /// Travada em RAM por mlock
        const MLOCKED = 1 << 8;
        /// Reservada no boot; nunca entra no buddy
        const RESERVED = 1 << 9;
        /// Livre, cabeça de bloco buddy (`private` = ordem)
        const BUDDY = 1 << 10;
        /// Estacionada num cache per-CPU (`private` = tipo de migração)
        const PCP = 1 << 11;
        /// Writeback iniciado pelo reclaim: liberar quando concluir
        const RECLAIM = 1 << 12;
        /// Slot de swap alocado (`private` = slot)
        const SWAP_CACHE = 1 << 13;
        /// Isolada de uma lista LRU por um batch de reclaim
        const ISOLATED = 1 << 14;
    }
}

/// Metadados atômicos de um frame físico.
#[repr(C, align(32))]
pub struct PageDescriptor {
    flags: AtomicU32,
    ref_count: AtomicU32,
    map_count: AtomicU32,
    /// Ordem (quando BUDDY), tipo de migração (quando PCP/alocada),
    /// slot de swap (quando SWAP_CACHE): contextual, como no kernel.
    private: AtomicU32,
    mapping: AtomicU32,
}

impl PageDescriptor {
    pub const fn new() -> Self {
        Self {
            flags: AtomicU32::new(PageFlags::RESERVED.bits()),
            ref_count: AtomicU32::new(0),
            map_count: AtomicU32::new(0),
            private: AtomicU32::new(0),
            mapping: AtomicU32::new(NO_MAPPING),
        }
    }

    // =========================================================================
    // FLAGS
    // =========================================================================

    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    #[inline]
    pub fn test(&self, flag: PageFlags) -> bool {
        self.flags().contains(flag)
    }

    #[inline]
    pub fn set(&self, flag: PageFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    #[inline]
    pub fn clear(&self, flag: PageFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    /// Seta e devolve se já estava setado.
    #[inline]
    pub fn test_and_set(&self, flag: PageFlags) -> bool {
        let old = self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
        old & flag.bits() == flag.bits()
    }

    /// Limpa e devolve se estava setado.
    #[inline]
    pub fn test_and_clear(&self, flag: PageFlags) -> bool {
        let old = self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
        old & flag.bits() == flag.bits()
    }

    /// Zera todos os bits (página voltando ao buddy).
    pub fn reset_flags(&self, flags: PageFlags) {
        self.flags.store(flags.bits(), Ordering::Release);
    }

    // =========================================================================
    // LOCK DE PÁGINA
    // =========================================================================

    /// Tenta trancar sem bloquear. O reclaim só usa trylock: página
    /// ocupada é assunto de quem a ocupou.
    pub fn trylock(&self) -> bool {
        !self.test_and_set(PageFlags::LOCKED)
    }

    pub fn unlock(&self) {
        let was = self.test_and_clear(PageFlags::LOCKED);
        debug_assert!(was, "unlock de página não trancada");
    }

    pub fn is_locked(&self) -> bool {
        self.test(PageFlags::LOCKED)
    }

    // =========================================================================
    // CONTAGEM DE REFERÊNCIAS
    // =========================================================================

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn set_ref_count(&self, count: u32) {
        self.ref_count.store(count, Ordering::Release);
    }

    /// Incrementa; a página já deve ter pelo menos uma referência.
    pub fn get_page(&self) {
        let old = self.ref_count.fetch_add(1, Ordering::AcqRel);
        debug_assert!(old > 0, "get_page em página sem referências");
    }

    /// Incrementa somente se ainda há referências (corrida com free).
    pub fn get_page_unless_zero(&self) -> bool {
        let mut current = self.ref_count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match self.ref_count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(v) => current = v,
            }
        }
    }

    /// Decrementa e responde se chegou a zero (gatilho único de liberação).
    pub fn put_page_testzero(&self) -> bool {
        let old = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(old > 0, "put_page em página já livre");
        old == 1
    }

    /// Congela a contagem em zero se estiver exatamente em `expected`.
    /// É o teste autoritativo do `remove_mapping`: só então a página
    /// deixa de existir como entidade rastreada.
    pub fn freeze_refs(&self, expected: u32) -> bool {
        self.ref_count
            .compare_exchange(expected, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Desfaz um congelamento que não pôde prosseguir.
    pub fn unfreeze_refs(&self, count: u32) {
        debug_assert_eq!(self.ref_count(), 0);
        self.ref_count.store(count, Ordering::Release);
    }

    // =========================================================================
    // MAPEAMENTOS (page tables)
    // =========================================================================

    pub fn map_count(&self) -> u32 {
        self.map_count.load(Ordering::Acquire)
    }

    pub fn set_map_count(&self, count: u32) {
        self.map_count.store(count, Ordering::Release);
    }

    /// Mais uma page table aponta para cá. Devolve o total novo.
    pub fn inc_map_count(&self) -> u32 {
        self.map_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Um mapeamento a menos. Devolve o total que restou.
    pub fn dec_map_count(&self) -> u32 {
        debug_assert!(self.map_count() > 0);
        self.map_count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Página presente em alguma page table?
    pub fn is_mapped(&self) -> bool {
        self.map_count() > 0
    }

    // =========================================================================
    // PRIVATE / MAPPING
    // =========================================================================

    pub fn private(&self) -> u32 {
        self.private.load(Ordering::Acquire)
    }

    pub fn set_private(&self, value: u32) {
        self.private.store(value, Ordering::Release);
    }

    /// Anota ordem e free list de repouso de um bloco buddy livre.
    /// A lista pode divergir do tipo do pageblock depois de um roubo
    /// parcial; quem desencadeia a fusão precisa dela para deslinkar.
    pub fn set_buddy_info(&self, order: usize, mt: MigrateType) {
        self.set_private(order as u32 | ((mt as u32) << 8));
    }

    /// Ordem de repouso de um bloco buddy livre.
    pub fn buddy_order(&self) -> usize {
        debug_assert!(self.test(PageFlags::BUDDY));
        (self.private() & 0xff) as usize
    }

    /// Free list em que o bloco está estacionado.
    pub fn buddy_migratetype(&self) -> MigrateType {
        debug_assert!(self.test(PageFlags::BUDDY));
        MigrateType::from_u8(((self.private() >> 8) & 0xff) as u8)
    }

    pub fn mapping(&self) -> MappingId {
        self.mapping.load(Ordering::Acquire)
    }

    pub fn set_mapping(&self, mapping: MappingId) {
        self.mapping.store(mapping, Ordering::Release);
    }

    /// Página anônima (backing em swap, sem address space de arquivo)?
    pub fn is_anon(&self) -> bool {
        self.test(PageFlags::SWAP_BACKED)
    }
}

impl Default for PageDescriptor {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// TABELA DE FRAMES
// =============================================================================

/// Tabela de descritores do intervalo físico gerido, indexada por PFN.
pub(crate) struct FrameTable {
    base_pfn: usize,
    frames: Box<[PageDescriptor]>,
}

impl FrameTable {
    /// Todos os descritores nascem RESERVED; o bootstrap libera os
    /// intervalos utilizáveis um a um.
    pub fn new(base_pfn: usize, count: usize) -> Self {
        let mut frames = Vec::new();
        frames.resize_with(count, PageDescriptor::new);
        Self {
            base_pfn,
            frames: frames.into_boxed_slice(),
        }
    }

    pub fn base_pfn(&self) -> usize {
        self.base_pfn
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn contains(&self, pfn: usize) -> bool {
        pfn >= self.base_pfn && pfn < self.base_pfn + self.frames.len()
    }

    #[inline]
    pub fn page(&self, pfn: usize) -> &PageDescriptor {
        &self.frames[pfn - self.base_pfn]
    }
}

// =============================================================================
// HANDLE RAII DE UM BLOCO ALOCADO
// =============================================================================

/// Identificação plana de um bloco, sem semântica de posse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunInfo {
    pub pfn: usize,
    pub order: usize,
    pub migratetype: MigrateType,
}

impl RunInfo {
    /// Número de páginas do bloco.
    #[inline]
    pub fn pages(&self) -> usize {
        1 << self.order
    }
}

/// Posse de um bloco de `2^order` páginas contíguas.
///
/// Clonar incrementa a contagem de referências do descritor-cabeça; o drop
/// da última clone é o único caminho público que devolve o bloco às listas
/// livres. Não existe double-free por construção.
pub struct PageRun {
    mem: Option<Arc<SystemMemory>>,
    info: RunInfo,
}

impl PageRun {
    /// Constrói o handle de um bloco recém-retirado do buddy
    /// (ref_count da cabeça já em 1).
    pub(crate) fn new(mem: Arc<SystemMemory>, info: RunInfo) -> Self {
        debug_assert_eq!(mem.page(info.pfn).ref_count(), 1);
        Self {
            mem: Some(mem),
            info,
        }
    }

    #[inline]
    pub fn pfn(&self) -> usize {
        self.info.pfn
    }

    #[inline]
    pub fn order(&self) -> usize {
        self.info.order
    }

    #[inline]
    pub fn pages(&self) -> usize {
        self.info.pages()
    }

    #[inline]
    pub fn migratetype(&self) -> MigrateType {
        self.info.migratetype
    }

    #[inline]
    pub fn info(&self) -> RunInfo {
        self.info
    }

    /// Entrega a referência deste handle para outro dono lógico (ex.: o
    /// page cache ao inserir no LRU). A contagem NÃO é decrementada; quem
    /// recebeu responde por ela daqui em diante.
    pub(crate) fn into_raw(mut self) -> RunInfo {
        self.mem = None;
        self.info
    }
}

impl Clone for PageRun {
    fn clone(&self) -> Self {
        let mem = self.mem.as_ref().expect("PageRun sem contexto").clone();
        mem.page(self.info.pfn).get_page();
        Self {
            mem: Some(mem),
            info: self.info,
        }
    }
}

impl Drop for PageRun {
    fn drop(&mut self) {
        if let Some(mem) = self.mem.take() {
            if mem.page(self.info.pfn).put_page_testzero() {
                mem.release_run(self.info);
            }
        }
    }
}

impl core::fmt::Debug for PageRun {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageRun")
            .field("pfn", &self.info.pfn)
            .field("order", &self.info.order)
            .field("migratetype", &self.info.migratetype)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trylock_is_exclusive() {
        let page = PageDescriptor::new();
        assert!(page.trylock());
        assert!(!page.trylock());
        page.unlock();
        assert!(page.trylock());
    }

    #[test]
    fn get_unless_zero_fails_on_free_page() {
        let page = PageDescriptor::new();
        assert!(!page.get_page_unless_zero());
        page.set_ref_count(1);
        assert!(page.get_page_unless_zero());
        assert_eq!(page.ref_count(), 2);
    }

    #[test]
    fn put_testzero_fires_exactly_once() {
        let page = PageDescriptor::new();
        page.set_ref_count(2);
        assert!(!page.put_page_testzero());
        assert!(page.put_page_testzero());
    }

    #[test]
    fn freeze_requires_exact_count() {
        let page = PageDescriptor::new();
        page.set_ref_count(2);
        assert!(!page.freeze_refs(1));
        assert!(page.freeze_refs(2));
        assert_eq!(page.ref_count(), 0);
        page.unfreeze_refs(2);
        assert_eq!(page.ref_count(), 2);
    }

    #[test]
    fn test_and_clear_reports_previous_state() {
        let page = PageDescriptor::new();
        page.set(PageFlags::REFERENCED);
        assert!(page.test_and_clear(PageFlags::REFERENCED));
        assert!(!page.test_and_clear(PageFlags::REFERENCED));
    }
}
