use servitor_core::ProcessManagerFactory;

/// Platform-independent factory that selects the implementation at compile time
pub struct PlatformProcessManagerFactory;

impl ProcessManagerFactory for PlatformProcessManagerFactory {
    #[cfg(unix)]
    type Manager = servitor_unix::UnixProcessManager;

    #[cfg(windows)]
    type Manager = servitor_windows::WindowsProcessManager;

    fn create_process_manager() -> Self::Manager {
        #[cfg(unix)]
        return servitor_unix::UnixProcessManagerFactory::create_process_manager();

        #[cfg(windows)]
        return servitor_windows::WindowsProcessManagerFactory::create_process_manager();
    }

    fn platform_name() -> &'static str {
        #[cfg(unix)]
        return "unix";

        #[cfg(windows)]
        return "windows";
    }
}
