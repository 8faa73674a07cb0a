diesel::table! {
    eventos (id) {
        id -> Uuid,
        origen -> Varchar,
        tipo -> Varchar,
        payload -> Jsonb,
        estado -> Varchar,
        intentos -> Int4,
        recibido_en -> Timestamptz,
        procesado_en -> Nullable<Timestamptz>,
        ultimo_intento -> Nullable<Timestamptz>,
        error_msg -> Nullable<Text>,
        id_externo -> Nullable<Varchar>,
        proximo_intento -> Nullable<Timestamptz>,
        reclamado_en -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    agencias (id) {
        id -> Uuid,
        nombre -> Varchar,
        stripe_account_id -> Nullable<Varchar>,
        cobros_habilitados -> Bool,
        pagos_habilitados -> Bool,
        onboarding_completo -> Bool,
        actualizado_en -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    reservas (id) {
        id -> Uuid,
        agencia_id -> Uuid,
        estado -> Varchar,
        stripe_session_id -> Nullable<Varchar>,
        actualizado_en -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    pagos (id) {
        id -> Uuid,
        reserva_id -> Uuid,
        stripe_session_id -> Varchar,
        stripe_payment_intent_id -> Nullable<Varchar>,
        monto -> Numeric,
        moneda -> Varchar,
        estado -> Varchar,
        creado_en -> Nullable<Timestamptz>,
        actualizado_en -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    liquidaciones (stripe_payout_id) {
        stripe_payout_id -> Varchar,
        stripe_account_id -> Nullable<Varchar>,
        monto -> Numeric,
        moneda -> Varchar,
        estado -> Varchar,
        fecha_llegada -> Nullable<Timestamptz>,
        actualizado_en -> Nullable<Timestamptz>,
    }
}

diesel::joinable!(reservas -> agencias (agencia_id));
diesel::joinable!(pagos -> reservas (reserva_id));

diesel::allow_tables_to_appear_in_same_query!(
    agencias,
    eventos,
    liquidaciones,
    pagos,
    reservas,
);
