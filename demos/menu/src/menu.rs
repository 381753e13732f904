//! Menu state and the request handler serving it.

use crate::protocol::Dish;
use hatch_server::{Envelope, Handler, MessageKind, Outbound};

pub struct Menu {
    dishes: Vec<Dish>,
}

impl Menu {
    pub fn new() -> Self {
        Self {
            dishes: vec![Dish {
                name: "Soup of the day".to_string(),
                description: "Ask the kitchen".to_string(),
                price: 450,
            }],
        }
    }

    fn listing(&self) -> Vec<Outbound> {
        match Envelope::with_payload(MessageKind::Dishes, &self.dishes) {
            Ok(envelope) => vec![Outbound::Reply(envelope)],
            Err(e) => {
                tracing::error!("Failed to encode menu: {}", e);
                Vec::new()
            }
        }
    }

    fn upsert(&mut self, dish: Dish) {
        match self.dishes.iter_mut().find(|d| d.name == dish.name) {
            Some(existing) => *existing = dish,
            None => self.dishes.push(dish),
        }
    }
}

impl Handler for Menu {
    fn handle(&mut self, request: &Envelope) -> Vec<Outbound> {
        match request.kind {
            MessageKind::GetDishes => self.listing(),
            MessageKind::AddDish | MessageKind::UpdateDish => match request.payload_as::<Dish>() {
                Ok(dish) => {
                    tracing::info!(from = %request.origin, "{} {}", request.kind, dish.name);
                    self.upsert(dish);
                    // Everyone re-fetches; the payload never travels with the signal.
                    vec![Outbound::Broadcast(Envelope::update())]
                }
                Err(e) => {
                    tracing::warn!(from = %request.origin, "Ignoring {}: {}", request.kind, e);
                    Vec::new()
                }
            },
            other => {
                tracing::debug!(from = %request.origin, "No handler for {}", other);
                Vec::new()
            }
        }
    }
}
