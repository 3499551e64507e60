//! Built-in monitoring thresholds for known digital libraries.
//!
//! Values reflect observed server behavior: hosts that stall or serve very
//! large IIIF manifests get longer timeouts and lower split thresholds.

use super::LibraryMonitoringConfig;

/// Conservative settings used for libraries without a dedicated entry.
pub(crate) const DEFAULT_LIBRARY_CONFIG: LibraryMonitoringConfig =
    LibraryMonitoringConfig::new(15.0, 1.0, 1.0, 5.0, 300);

/// Built-in per-library table, keyed by normalized library name.
///
/// Base minutes budget a whole session: each is at least the per-operation
/// stall cap observed for that host (2 to 15 minutes), with a 10 minute floor.
pub(crate) const BUILTIN_LIBRARIES: &[(&str, LibraryMonitoringConfig)] = &[
    ("gallica", LibraryMonitoringConfig::new(15.0, 1.0, 2.0, 5.0, 500)),
    // Authentication redirects and very slow tile delivery
    (
        "internet_culturale",
        LibraryMonitoringConfig::new(20.0, 2.0, 1.0, 8.0, 400),
    ),
    ("manuscripta", LibraryMonitoringConfig::new(10.0, 1.5, 1.0, 5.0, 300)),
    ("nypl", LibraryMonitoringConfig::new(15.0, 1.2, 2.0, 5.0, 400)),
    // Manifests of 300KB+ and slow servers
    ("graz", LibraryMonitoringConfig::new(15.0, 2.5, 0.5, 10.0, 300)),
    ("verona", LibraryMonitoringConfig::new(15.0, 2.0, 1.0, 8.0, 300)),
    ("bdl", LibraryMonitoringConfig::new(10.0, 1.5, 1.0, 5.0, 300)),
    ("bne", LibraryMonitoringConfig::new(10.0, 1.5, 1.0, 5.0, 300)),
    // Zoomify tile stitching is slow per page
    ("morgan", LibraryMonitoringConfig::new(15.0, 2.0, 0.5, 8.0, 200)),
    ("trinity", LibraryMonitoringConfig::new(15.0, 1.5, 1.0, 6.0, 300)),
    ("loc", LibraryMonitoringConfig::new(15.0, 1.5, 1.0, 6.0, 400)),
    ("hhu", LibraryMonitoringConfig::new(15.0, 1.5, 0.8, 6.0, 300)),
    (
        "vienna_manuscripta",
        LibraryMonitoringConfig::new(10.0, 1.5, 1.0, 4.0, 300),
    ),
    (
        "mdc_catalonia",
        LibraryMonitoringConfig::new(15.0, 1.5, 1.0, 6.0, 300),
    ),
    ("arca", LibraryMonitoringConfig::new(10.0, 1.0, 2.0, 5.0, 500)),
    (
        "e_manuscripta",
        LibraryMonitoringConfig::new(15.0, 1.5, 1.0, 6.0, 300),
    ),
    ("vatican", LibraryMonitoringConfig::new(15.0, 1.2, 2.0, 5.0, 500)),
    (
        "british_library",
        LibraryMonitoringConfig::new(15.0, 1.2, 1.5, 5.0, 400),
    ),
    ("cambridge", LibraryMonitoringConfig::new(15.0, 1.2, 1.5, 5.0, 400)),
    ("florence", LibraryMonitoringConfig::new(20.0, 2.0, 1.0, 8.0, 300)),
    ("unifr", LibraryMonitoringConfig::new(10.0, 1.0, 2.0, 5.0, 500)),
];
