pub use paste::paste;
pub use prometheus;

/// Shared body of the `register_catalog_*!` macros: a lazily registered
/// static named after the metric. The reported name is the lower snake case
/// form of `$NAME` and is checked at compile time.
#[doc(hidden)]
#[macro_export]
macro_rules! __catalog_metric_static {
    ($VIS:vis $NAME:ident: $KIND:ident = $REGISTER:ident($HELP:literal $(, $LABELS:expr)?)) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::$KIND> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    const NAME: $crate::MetricName =
                        $crate::MetricName::new(stringify!([<$NAME:lower>]));
                }
                const HELP: &str = $crate::checked_help($HELP);
                $crate::prometheus::$REGISTER!(
                    NAME.as_str(),
                    HELP,
                    $($LABELS,)?
                    $crate::CATALOG_METRICS_REGISTRY,
                )
                .unwrap_or_else(|e| panic!("Failed to register {}: {e}", NAME.as_str()))
            });
    };
}

/// Declare an integer counter. Pass a label slice as the third argument to
/// get an `IntCounterVec` instead.
#[macro_export]
macro_rules! register_catalog_counter {
    ($VIS:vis $NAME:ident, $HELP:literal $(,)?) => {
        $crate::__catalog_metric_static!(
            $VIS $NAME: IntCounter = register_int_counter_with_registry($HELP)
        );
    };
    ($VIS:vis $NAME:ident, $HELP:literal, $LABELS:expr $(,)?) => {
        $crate::__catalog_metric_static!(
            $VIS $NAME: IntCounterVec = register_int_counter_vec_with_registry($HELP, $LABELS)
        );
    };
}

/// Declare a floating point gauge.
#[macro_export]
macro_rules! register_catalog_gauge {
    ($VIS:vis $NAME:ident, $HELP:literal $(,)?) => {
        $crate::__catalog_metric_static!(
            $VIS $NAME: Gauge = register_gauge_with_registry($HELP)
        );
    };
}

/// Declare a labelled histogram, usually fed by a [`StatusTimer`](crate::StatusTimer).
#[macro_export]
macro_rules! register_catalog_histogram {
    ($VIS:vis $NAME:ident, $HELP:literal, $LABELS:expr $(,)?) => {
        $crate::__catalog_metric_static!(
            $VIS $NAME: HistogramVec = register_histogram_vec_with_registry($HELP, $LABELS)
        );
    };
}
