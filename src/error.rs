//! Tipos de Erro do Alocador Físico
//!
//! Condições transitórias (zona sem páginas, watermark reprovado, página
//! que não pôde ser trancada) nunca viram erro: são tratadas internamente
//! com retry/escalada. Só dois desfechos cruzam a fronteira pública:
//! sucesso ou exaustão real.

/// Erros do alocador físico
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmError {
    /// Sem memória física disponível (slow path esgotado, OOM incluso)
    OutOfMemory,
    /// Ordem pedida >= MAX_ORDER
    OrderTooLarge,
    /// Parâmetro inválido (tunable fora de faixa, CPU inexistente)
    InvalidParameter,
}

impl MmError {
    /// Retorna descrição legível do erro
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OutOfMemory => "OOM: sem páginas físicas disponíveis",
            Self::OrderTooLarge => "Ordem acima do máximo alocável",
            Self::InvalidParameter => "Parâmetro inválido",
        }
    }
}

impl core::fmt::Display for MmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Tipo Result específico para operações de memória
pub type MmResult<T> = Result<T, MmError>;
