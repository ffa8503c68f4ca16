// =============================================================================
// LOGGING DO SUBSISTEMA - ZERO OVERHEAD
// =============================================================================
//
// Macros de log do forge-mm com custo ZERO quando desabilitadas.
//
// ARQUITETURA:
// - Features do Cargo fazem o filtering em compile-time
// - Com feature "no_logs", TODOS os macros viram expressões vazias
// - Macros ativos encaminham para a fachada `log`; o kernel embutidor
//   registra o sink (serial, VGA, ring buffer de teste, ...)
//
// NÍVEIS DE LOG (do mais crítico ao menos):
// - ERROR: Erros fatais ou críticos
// - WARN:  Situações suspeitas mas recuperáveis
// - INFO:  Fluxo normal de execução
// - DEBUG: Informações de debugging
// - TRACE: Detalhes extremos (cada alocação, cada passada de scan)
//
// FEATURES:
// - no_logs:   Remove 100% dos logs
// - log_error: Apenas ERROR, WARN, [OK]/[FAIL]
// - log_info:  + INFO
// - log_debug: + DEBUG
// - log_trace: Todos os níveis (padrão)
//
// CONVENÇÃO DE MENSAGEM:
//   kinfo!("(PMM) Zona {} pronta: {} páginas", name, pages);
// O prefixo "(SUBSYS)" identifica a origem dentro do subsistema.
//
// =============================================================================

// =============================================================================
// MACROS DE LOG - NÍVEL ERROR
// =============================================================================
//
// kerror! - Sempre ativo (exceto com no_logs)
// Usado para erros críticos que podem causar crash.
//

#[cfg(not(feature = "no_logs"))]
#[macro_export]
macro_rules! kerror {
    ($($arg:tt)+) => {{
        ::log::error!($($arg)+);
    }};
}

#[cfg(feature = "no_logs")]
#[macro_export]
macro_rules! kerror {
    ($($t:tt)*) => {{}};
}

// =============================================================================
// MACROS DE LOG - NÍVEL WARN
// =============================================================================
//
// kwarn! - Ativo exceto com no_logs
// Usado para situações suspeitas mas recuperáveis.
//

#[cfg(not(feature = "no_logs"))]
#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)+) => {{
        ::log::warn!($($arg)+);
    }};
}

#[cfg(feature = "no_logs")]
#[macro_export]
macro_rules! kwarn {
    ($($t:tt)*) => {{}};
}

// =============================================================================
// MACROS DE LOG - NÍVEL INFO
// =============================================================================
//
// kinfo! - Ativo com log_info, log_debug ou log_trace
// Usado para eventos importantes do fluxo normal.
//

#[cfg(any(feature = "log_info", feature = "log_debug", feature = "log_trace"))]
#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)+) => {{
        ::log::info!($($arg)+);
    }};
}

#[cfg(not(any(feature = "log_info", feature = "log_debug", feature = "log_trace")))]
#[macro_export]
macro_rules! kinfo {
    ($($t:tt)*) => {{}};
}

// =============================================================================
// MACROS DE LOG - NÍVEL DEBUG
// =============================================================================
//
// kdebug! - Ativo apenas com log_debug ou log_trace
// Usado para informações de debugging.
//

#[cfg(any(feature = "log_debug", feature = "log_trace"))]
#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)+) => {{
        ::log::debug!($($arg)+);
    }};
}

#[cfg(not(any(feature = "log_debug", feature = "log_trace")))]
#[macro_export]
macro_rules! kdebug {
    ($($t:tt)*) => {{}};
}

// =============================================================================
// MACROS DE LOG - NÍVEL TRACE
// =============================================================================
//
// ktrace! - Ativo apenas com log_trace
// Usado para detalhes extremos de cada operação.
//

#[cfg(feature = "log_trace")]
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)+) => {{
        ::log::trace!($($arg)+);
    }};
}

#[cfg(not(feature = "log_trace"))]
#[macro_export]
macro_rules! ktrace {
    ($($t:tt)*) => {{}};
}

// =============================================================================
// MACROS DE STATUS (OK/FAIL)
// =============================================================================

/// kok! - Log de sucesso (prefixo [OK], usado pelo self-test).
#[cfg(not(feature = "no_logs"))]
#[macro_export]
macro_rules! kok {
    ($($arg:tt)+) => {{
        ::log::info!("[OK] {}", ::core::format_args!($($arg)+));
    }};
}

#[cfg(feature = "no_logs")]
#[macro_export]
macro_rules! kok {
    ($($t:tt)*) => {{}};
}

/// kfail! - Log de falha (prefixo [FAIL], usado pelo self-test).
#[cfg(not(feature = "no_logs"))]
#[macro_export]
macro_rules! kfail {
    ($($arg:tt)+) => {{
        ::log::error!("[FAIL] {}", ::core::format_args!($($arg)+));
    }};
}

#[cfg(feature = "no_logs")]
#[macro_export]
macro_rules! kfail {
    ($($t:tt)*) => {{}};
}
