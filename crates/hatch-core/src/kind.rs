//! Message kinds.
//!
//! The set is closed: every request kind has at most one paired response
//! kind, and `Update` is a payload-less push notification.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Discriminator of an envelope's request/response role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Register,
    RegisterSuccess,
    Login,
    LoginSuccess,
    GetPostcodes,
    Postcodes,
    GetDishes,
    Dishes,
    GetBasket,
    Basket,
    GetBasketCost,
    BasketCost,
    GetOrders,
    Orders,
    GetStatus,
    Status,
    GetCost,
    Cost,
    SendCheckout,
    Order,
    SendClear,
    SendCancel,
    AddDish,
    UpdateDish,
    /// Refresh signal. Never carries a payload and is never handed to
    /// ordinary receivers.
    Update,
}

/// Whether a kind expects a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadRule {
    Required,
    Optional,
    Forbidden,
}

impl MessageKind {
    /// Every kind, in declaration order.
    pub const ALL: [MessageKind; 25] = [
        MessageKind::Register,
        MessageKind::RegisterSuccess,
        MessageKind::Login,
        MessageKind::LoginSuccess,
        MessageKind::GetPostcodes,
        MessageKind::Postcodes,
        MessageKind::GetDishes,
        MessageKind::Dishes,
        MessageKind::GetBasket,
        MessageKind::Basket,
        MessageKind::GetBasketCost,
        MessageKind::BasketCost,
        MessageKind::GetOrders,
        MessageKind::Orders,
        MessageKind::GetStatus,
        MessageKind::Status,
        MessageKind::GetCost,
        MessageKind::Cost,
        MessageKind::SendCheckout,
        MessageKind::Order,
        MessageKind::SendClear,
        MessageKind::SendCancel,
        MessageKind::AddDish,
        MessageKind::UpdateDish,
        MessageKind::Update,
    ];

    /// The kind a peer answers this request with, if any.
    pub fn response(self) -> Option<MessageKind> {
        use MessageKind::*;
        match self {
            Register => Some(RegisterSuccess),
            Login => Some(LoginSuccess),
            GetPostcodes => Some(Postcodes),
            GetDishes => Some(Dishes),
            GetBasket => Some(Basket),
            GetBasketCost => Some(BasketCost),
            GetOrders => Some(Orders),
            GetStatus => Some(Status),
            GetCost => Some(Cost),
            SendCheckout => Some(Order),
            _ => None,
        }
    }

    /// The request this kind answers, if it is a response.
    pub fn request(self) -> Option<MessageKind> {
        Self::ALL.into_iter().find(|k| k.response() == Some(self))
    }

    /// Whether this kind is a response to some request.
    pub fn is_response(self) -> bool {
        self.request().is_some()
    }

    pub fn payload_rule(self) -> PayloadRule {
        match self {
            MessageKind::Update => PayloadRule::Forbidden,
            k if k.is_response() => PayloadRule::Required,
            _ => PayloadRule::Optional,
        }
    }

    /// Wire name, e.g. `GET_BASKET_COST`.
    pub fn as_str(self) -> &'static str {
        use MessageKind::*;
        match self {
            Register => "REGISTER",
            RegisterSuccess => "REGISTER_SUCCESS",
            Login => "LOGIN",
            LoginSuccess => "LOGIN_SUCCESS",
            GetPostcodes => "GET_POSTCODES",
            Postcodes => "POSTCODES",
            GetDishes => "GET_DISHES",
            Dishes => "DISHES",
            GetBasket => "GET_BASKET",
            Basket => "BASKET",
            GetBasketCost => "GET_BASKET_COST",
            BasketCost => "BASKET_COST",
            GetOrders => "GET_ORDERS",
            Orders => "ORDERS",
            GetStatus => "GET_STATUS",
            Status => "STATUS",
            GetCost => "GET_COST",
            Cost => "COST",
            SendCheckout => "SEND_CHECKOUT",
            Order => "ORDER",
            SendClear => "SEND_CLEAR",
            SendCancel => "SEND_CANCEL",
            AddDish => "ADD_DISH",
            UpdateDish => "UPDATE_DISH",
            Update => "UPDATE",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
