use eframe::egui;
use log::warn;

use tangent_loom::gui::frontend::CanvasApp;
use tangent_loom::persistence::persist;
use tangent_loom::persistence::settings::AppSettings;

fn main() -> eframe::Result {
    env_logger::init();

    let settings = AppSettings::load().unwrap_or_else(|e| {
        warn!("using default settings: {}", e);
        AppSettings::default()
    });
    persist::set_settings_override(settings.clone());
    let loaded_state = persist::load_active().ok().flatten();

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([1300.0, 710.0])
            // Keep the canvas and details panel usable on small screens
            .with_min_inner_size([700.0, 420.0])
            .with_resizable(true),
        ..Default::default()
    };
    eframe::run_native(
        "Tangent-Loom",
        options,
        Box::new(move |_cc| Ok(Box::new(CanvasApp::new(settings, loaded_state)) as Box<dyn eframe::App>)),
    )
}
