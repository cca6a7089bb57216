/// Foreground state reported by the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppLifecycle {
    /// Visible and interactive.
    #[default]
    Foreground,
    /// Visible but not receiving input.
    Inactive,
    /// Not visible.
    Background,
}

/// The background signal that caused a refetch sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RefetchTrigger {
    Reconnect,
    Focus,
}
