use std::path::PathBuf;
use zbus::interface;

use crate::kiosk::KioskHandle;
use crate::store::AttendanceStore;

/// D-Bus interface for the facegate attendance daemon.
///
/// Bus name: org.facegate.Kiosk1
/// Object path: /org/facegate/Kiosk1
pub struct KioskService {
    pub kiosk: KioskHandle,
    pub store: AttendanceStore,
}

#[interface(name = "org.facegate.Kiosk1")]
impl KioskService {
    /// Return daemon status information as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let kiosk = self
            .kiosk
            .status()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        let employees = self.store.count_employees().await.unwrap_or(0);

        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "employees_enrolled": employees,
            "frames_processed": kiosk.frames_processed,
            "gallery_size": kiosk.gallery_size,
            "challenge_active": kiosk.challenge_active,
            "last_outcome": kiosk.last_outcome,
        })
        .to_string())
    }

    /// Rebuild the matching gallery from the store. Returns the entry count.
    async fn reload_gallery(&self) -> zbus::fdo::Result<u32> {
        tracing::info!("gallery reload requested");
        let gallery = self
            .store
            .gallery()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        let count = self
            .kiosk
            .reload_gallery(gallery)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        Ok(count as u32)
    }

    /// Enroll an employee from a reference image on disk.
    ///
    /// Returns the employee id. The kiosk gallery is reloaded on success.
    async fn enroll(&self, name: &str, image_path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(name, image_path, "enroll requested");

        if name.trim().is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs("empty name".into()));
        }

        let embedding = self
            .kiosk
            .encode_image(PathBuf::from(image_path))
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "enroll: embedding extraction failed");
                zbus::fdo::Error::Failed(e.to_string())
            })?;

        let id = self
            .store
            .enroll(name.trim(), &embedding)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "enroll: store insert failed");
                zbus::fdo::Error::Failed(e.to_string())
            })?;

        let gallery = self
            .store
            .gallery()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        self.kiosk
            .reload_gallery(gallery)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

        tracing::info!(id = %id, name, "enrolled successfully");
        Ok(id)
    }

    /// Remove an enrolled employee by name. Returns false when absent.
    async fn remove(&self, name: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(name, "remove requested");
        let removed = self
            .store
            .remove(name)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

        if removed {
            let gallery = self
                .store
                .gallery()
                .await
                .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
            self.kiosk
                .reload_gallery(gallery)
                .await
                .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
            tracing::info!(name, "employee removed");
        } else {
            tracing::warn!(name, "employee not found");
        }
        Ok(removed)
    }

    /// List enrolled employees as JSON.
    async fn list_employees(&self) -> zbus::fdo::Result<String> {
        let employees = self
            .store
            .list_employees()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        serde_json::to_string(&employees).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Today's attendance rows as JSON.
    async fn today(&self) -> zbus::fdo::Result<String> {
        let records = self
            .store
            .today()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        serde_json::to_string(&records).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Attendance rows for an explicit date (YYYY-MM-DD) as JSON.
    async fn report(&self, date: &str) -> zbus::fdo::Result<String> {
        let records = self
            .store
            .report_for(date)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        serde_json::to_string(&records).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }
}
