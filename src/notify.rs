use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{BookingStatus, Ms};

const CHANNEL_CAPACITY: usize = 256;

/// Real-time booking updates for connected observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "payload")]
pub enum Notice {
    #[serde(rename = "booking:new")]
    BookingNew {
        booking_id: Ulid,
        start: Ms,
        end: Ms,
        vehicle_id: Option<Ulid>,
    },
    /// `from` is the vehicle the booking left, whose slot is now free.
    #[serde(rename = "booking:vehicle_assigned")]
    VehicleAssigned {
        booking_id: Ulid,
        from: Option<Ulid>,
        vehicle_id: Ulid,
    },
    #[serde(rename = "booking:driver_assigned")]
    DriverAssigned { booking_id: Ulid, driver_id: Ulid },
    #[serde(rename = "booking:status_change")]
    StatusChange {
        booking_id: Ulid,
        vehicle_id: Option<Ulid>,
        status: BookingStatus,
    },
}

impl Notice {
    pub fn kind(&self) -> &'static str {
        match self {
            Notice::BookingNew { .. } => "booking:new",
            Notice::VehicleAssigned { .. } => "booking:vehicle_assigned",
            Notice::DriverAssigned { .. } => "booking:driver_assigned",
            Notice::StatusChange { .. } => "booking:status_change",
        }
    }

    /// Vehicles whose subscribers should see this notice. A reassignment
    /// concerns both the old and the new vehicle.
    pub fn vehicle_ids(&self) -> impl Iterator<Item = Ulid> {
        let (primary, secondary) = match self {
            Notice::BookingNew { vehicle_id, .. } | Notice::StatusChange { vehicle_id, .. } => (*vehicle_id, None),
            Notice::VehicleAssigned { from, vehicle_id, .. } => {
                (Some(*vehicle_id), from.filter(|f| f != vehicle_id))
            }
            Notice::DriverAssigned { .. } => (None, None),
        };
        primary.into_iter().chain(secondary)
    }
}

/// Fire-and-forget publication. Delivery is never guaranteed and never
/// affects booking state.
pub trait Notifier: Send + Sync {
    fn publish(&self, notice: Notice);
}

/// Broadcast hub: one channel for everything plus one per vehicle.
pub struct NotifyHub {
    all: broadcast::Sender<Notice>,
    vehicles: DashMap<Ulid, broadcast::Sender<Notice>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            all: broadcast::channel(CHANNEL_CAPACITY).0,
            vehicles: DashMap::new(),
        }
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Notice> {
        self.all.subscribe()
    }

    /// Subscribe to notices about one vehicle. Creates the channel if needed.
    pub fn subscribe(&self, vehicle_id: Ulid) -> broadcast::Receiver<Notice> {
        let sender = self
            .vehicles
            .entry(vehicle_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }
}

impl Notifier for NotifyHub {
    /// No-op for channels nobody listens on.
    fn publish(&self, notice: Notice) {
        for vid in notice.vehicle_ids() {
            if let Some(sender) = self.vehicles.get(&vid) {
                let _ = sender.send(notice.clone());
            }
        }
        let _ = self.all.send(notice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let vid = Ulid::new();
        let mut rx = hub.subscribe(vid);
        let mut all = hub.subscribe_all();

        let notice = Notice::VehicleAssigned {
            booking_id: Ulid::new(),
            from: None,
            vehicle_id: vid,
        };
        hub.publish(notice.clone());

        assert_eq!(rx.recv().await.unwrap(), notice);
        assert_eq!(all.recv().await.unwrap(), notice);
    }

    #[tokio::test]
    async fn other_vehicles_stay_quiet() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe(Ulid::new());
        hub.publish(Notice::VehicleAssigned {
            booking_id: Ulid::new(),
            from: None,
            vehicle_id: Ulid::new(),
        });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn reassignment_reaches_old_and_new_vehicle() {
        let hub = NotifyHub::new();
        let (old, new) = (Ulid::new(), Ulid::new());
        let mut old_rx = hub.subscribe(old);
        let mut new_rx = hub.subscribe(new);
        let mut all = hub.subscribe_all();

        let notice = Notice::VehicleAssigned {
            booking_id: Ulid::new(),
            from: Some(old),
            vehicle_id: new,
        };
        hub.publish(notice.clone());

        assert_eq!(old_rx.recv().await.unwrap(), notice);
        assert_eq!(new_rx.recv().await.unwrap(), notice);
        assert_eq!(all.recv().await.unwrap(), notice);
        assert!(all.try_recv().is_err());

        let json = serde_json::to_value(&notice).unwrap();
        assert_eq!(json["payload"]["from"], old.to_string());
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.publish(Notice::DriverAssigned {
            booking_id: Ulid::new(),
            driver_id: Ulid::new(),
        });
    }

    #[test]
    fn payload_carries_event_name() {
        let notice = Notice::StatusChange {
            booking_id: Ulid::new(),
            vehicle_id: None,
            status: BookingStatus::Approved,
        };
        let json = serde_json::to_value(&notice).unwrap();
        assert_eq!(json["event"], notice.kind());
        assert_eq!(json["payload"]["status"], "APPROVED");
    }
}
